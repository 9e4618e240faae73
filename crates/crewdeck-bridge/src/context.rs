//! Parsing of the REPL's context-usage status line out of pane captures.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static ANSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

// `[ctx: 22% used, 155k remaining]`, tolerant of embedded whitespace and
// SI suffixes on the remaining-token figure.
static CTX_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[ctx:\s*(\d+)%\s*used,\s*([0-9]+(?:\.[0-9]+)?[kKmM]?)\s*remaining\]").unwrap()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextUsage {
    pub percent_used: i64,
    /// Kept as the rendered string ("155k", "1.5M", "100") because the REPL
    /// owns the unit.
    pub remaining_tokens: String,
    pub raw: String,
}

/// Extract the context-usage pair from rendered pane text, or `None` when no
/// status line is present.
pub fn parse_context_usage(text: &str) -> Option<ContextUsage> {
    if text.is_empty() {
        return None;
    }
    let stripped = ANSI.replace_all(text, "");
    let captures = CTX_LINE.captures(&stripped)?;
    let percent_used: i64 = captures.get(1)?.as_str().parse().ok()?;
    Some(ContextUsage {
        percent_used,
        remaining_tokens: captures.get(2)?.as_str().to_string(),
        raw: captures.get(0)?.as_str().to_string(),
    })
}
