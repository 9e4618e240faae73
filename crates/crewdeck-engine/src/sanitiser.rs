//! Error-output sanitisation for agent guardrails.
//!
//! Strips system-revealing detail from tool error output before it reaches
//! an agent's conversational context: file paths, stack traces, module
//! names, environment detail, process ids. A generic failure indication
//! survives so the agent can acknowledge and retry.

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTION: &str = "[details redacted]";

// Absolute file paths: /foo/bar/baz.rs, /home/user/.venv/lib/...
// (prefix group emulates a lookbehind for "not preceded by alnum")
static ABSOLUTE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<pre>^|[^A-Za-z0-9])(?:/(?:[A-Za-z0-9._-]+/)+[A-Za-z0-9._-]+)").unwrap()
});

// Individual stack frame lines: `  File "/path/to/file.py", line 42, in f`
static FRAME_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*File\s+"[^"]+",\s+line\s+\d+.*$"#).unwrap());

// Dotted module names with three or more components, delimiter-terminated:
// "app.db.errors.UndefinedColumn:" or "(psycopg2.errors.UndefinedColumn)"
static MODULE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[A-Za-z_]\w*\.){2,}[A-Za-z_]\w*(?P<post>[:)\s])").unwrap()
});

// Virtualenv path fragments
static VENV_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:venv|\.venv|virtualenv|site-packages|dist-packages)(?:/[A-Za-z0-9._-]+)*")
        .unwrap()
});

// Process ids: "pid=12345", "PID: 12345", "process 12345"
static PROCESS_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:pid[=:]\s*\d+|process\s+\d+)\b").unwrap());

// Language version strings: "Python 3.10.4", "node v20.11.0", "rustc 1.85.0"
static LANGUAGE_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:python|node|rustc|ruby|java)\s*v?\d+\.\d+(?:\.\d+)?\b").unwrap()
});

// Environment variable assignments: "DATABASE_URL=postgres://..." etc.
static ENV_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][A-Z0-9_]{3,}(?:=\S+|:\s+\S+)").unwrap());

static REPEATED_REDACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\[details redacted\]\s*){2,}").unwrap());

static TRIPLE_BLANK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n").unwrap());

static ERROR_INDICATORS: &[&str] = &[
    "traceback (most recent call last)",
    "error:",
    "exception:",
    "failed",
    "fatal:",
    "panic:",
];

/// Strip system-revealing information from error output.
pub fn sanitise_error_output(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    // Whole stack-trace blocks first (most comprehensive).
    let mut result = strip_traceback_blocks(text);

    // Frame lines that survive outside a full block.
    result = FRAME_LINE.replace_all(&result, REDACTION).into_owned();

    result = MODULE_NAME
        .replace_all(&result, format!("{REDACTION}$post"))
        .into_owned();

    result = ABSOLUTE_PATH
        .replace_all(&result, format!("$pre{REDACTION}"))
        .into_owned();

    result = VENV_PATH.replace_all(&result, REDACTION).into_owned();
    result = PROCESS_ID.replace_all(&result, REDACTION).into_owned();
    result = LANGUAGE_VERSION.replace_all(&result, REDACTION).into_owned();
    result = ENV_VAR.replace_all(&result, REDACTION).into_owned();

    result = REPEATED_REDACTION
        .replace_all(&result, format!("{REDACTION} "))
        .into_owned();
    result = TRIPLE_BLANK.replace_all(&result, "\n\n").into_owned();

    result.trim().to_string()
}

/// Gate: only text that reads like error output is sanitised at all, so
/// normal agent output passes through untouched.
pub fn contains_error_patterns(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lower = text.to_lowercase();
    if ERROR_INDICATORS.iter().any(|needle| lower.contains(needle)) {
        return true;
    }
    // A bare absolute path only counts in an error-ish context.
    ABSOLUTE_PATH.is_match(text) && (lower.contains("error") || lower.contains("failed"))
}

/// Replace each stack-trace block with a single redaction. A block starts at
/// the trace header and runs through its indented frames up to and including
/// the first non-indented line (the exception itself).
fn strip_traceback_blocks(text: &str) -> String {
    let mut output: Vec<&str> = Vec::new();
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        if !line.trim_start().starts_with("Traceback (most recent call last):") {
            output.push(line);
            continue;
        }
        // Consume indented frame lines.
        while let Some(next) = lines.peek() {
            if next.starts_with(char::is_whitespace) && !next.trim().is_empty() {
                lines.next();
            } else {
                break;
            }
        }
        // Consume the closing exception line when present.
        if let Some(next) = lines.peek()
            && !next.trim().is_empty()
        {
            lines.next();
        }
        output.push(REDACTION);
    }
    output.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceback_block_collapses_to_one_redaction() {
        let input = "command failed\nTraceback (most recent call last):\n  File \"/app/src/main.py\", line 10, in run\n    do_work()\n  File \"/app/src/work.py\", line 3, in do_work\n    raise ValueError(\"boom\")\nValueError: boom\n\nretrying";
        let output = sanitise_error_output(input);
        assert_eq!(output.matches(REDACTION).count(), 1);
        assert!(!output.contains("main.py"));
        assert!(!output.contains("ValueError"));
        assert!(output.contains("command failed"));
        assert!(output.contains("retrying"));
    }

    #[test]
    fn lone_frame_line_is_redacted() {
        let input = "  File \"/srv/app/handler.py\", line 42, in handle";
        let output = sanitise_error_output(input);
        assert!(!output.contains("handler.py"));
        assert!(output.contains(REDACTION));
    }

    #[test]
    fn absolute_paths_are_redacted() {
        let output = sanitise_error_output("error: cannot open /home/dev/secret/config.toml");
        assert!(!output.contains("/home/dev"));
        assert!(output.contains(REDACTION));
    }

    #[test]
    fn dotted_module_names_are_redacted() {
        let output = sanitise_error_output("(psycopg2.errors.UndefinedColumn) column does not exist");
        assert!(!output.contains("psycopg2"));
        assert!(output.contains("column does not exist"));

        // Two components stay: likely a filename, not a module path.
        let output = sanitise_error_output("see notes.txt for details ");
        assert!(output.contains("notes.txt"));
    }

    #[test]
    fn process_ids_and_versions_are_redacted() {
        let output = sanitise_error_output("error: worker pid=4242 crashed under Python 3.11.2");
        assert!(!output.contains("4242"));
        assert!(!output.contains("3.11"));
    }

    #[test]
    fn env_assignments_are_redacted() {
        let output = sanitise_error_output("error: DATABASE_URL=postgres://user:pw@host/db rejected");
        assert!(!output.contains("postgres://"));
        assert!(output.contains("rejected"));
    }

    #[test]
    fn venv_fragments_are_redacted() {
        let output = sanitise_error_output("error in site-packages/requests/adapters.py");
        assert!(!output.contains("site-packages"));
    }

    #[test]
    fn consecutive_redactions_collapse() {
        let input = "error at /a/b/c /d/e/f pid=1";
        let output = sanitise_error_output(input);
        assert_eq!(output.matches(REDACTION).count(), 1, "{output}");
    }

    #[test]
    fn non_error_text_passes_the_gate_untouched() {
        let text = "All 58 tests passed. The refactor is complete.";
        assert!(!contains_error_patterns(text));

        let path_but_calm = "Wrote the summary to /tmp/notes.md as requested";
        assert!(!contains_error_patterns(path_but_calm));
    }

    #[test]
    fn gate_detects_error_indicators() {
        assert!(contains_error_patterns("fatal: not a git repository"));
        assert!(contains_error_patterns("thread 'main' panic: index out of bounds"));
        assert!(contains_error_patterns("Traceback (most recent call last):"));
        assert!(contains_error_patterns("could not open /etc/app.conf: error 2"));
        assert!(!contains_error_patterns(""));
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(sanitise_error_output(""), "");
    }
}
