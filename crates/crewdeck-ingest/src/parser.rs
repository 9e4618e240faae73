use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crewdeck_types::{ObservedTurn, TimestampSource, TurnActor};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::schema::TranscriptRecord;
use crate::Result;

/// Stable content hash of a transcript entry: SHA-256 over the canonical
/// `actor` + `text` pair. Identical lines observed twice, by either ingest
/// path, hash identically.
pub fn entry_hash(actor: TurnActor, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(actor.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One message parsed from the transcript tail.
#[derive(Debug, Clone)]
pub struct ParsedTurn {
    pub actor: TurnActor,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    pub raw: Value,
    pub message_type: String,
    pub is_internal: bool,
    pub tool_input: Option<Value>,
}

impl ParsedTurn {
    pub fn to_observed(&self) -> ObservedTurn {
        ObservedTurn {
            actor: self.actor,
            text: self.text.clone(),
            timestamp: self.timestamp,
            timestamp_source: self.timestamp_source,
            entry_hash: Some(entry_hash(self.actor, &self.text)),
            is_internal: self.is_internal,
            tool_input: self.tool_input.clone(),
        }
    }
}

/// Incremental reader over one JSONL transcript.
///
/// Tracks a byte offset and only consumes complete lines; a partially
/// flushed tail line is left for the next pass. On restart offsets reset to
/// zero and downstream hash dedup absorbs the replay.
#[derive(Debug)]
pub struct TranscriptReader {
    path: PathBuf,
    position: u64,
}

impl TranscriptReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes currently on disk beyond the read offset.
    pub fn pending_bytes(&self) -> u64 {
        std::fs::metadata(&self.path)
            .map(|m| m.len().saturating_sub(self.position))
            .unwrap_or(0)
    }

    /// Read and parse everything appended since the last call.
    pub fn read_new_lines(&mut self) -> Result<Vec<ParsedTurn>> {
        let mut file = std::fs::File::open(&self.path)?;
        let len = file.metadata()?.len();

        // Truncated or rotated underneath us: start over.
        if len < self.position {
            self.position = 0;
        }
        if len == self.position {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.position))?;
        let mut buffer = Vec::with_capacity((len - self.position) as usize);
        file.read_to_end(&mut buffer)?;

        // Only consume up to the last newline; the remainder is a line
        // still being written.
        let consumed = match buffer.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => last_newline + 1,
            None => return Ok(Vec::new()),
        };
        let chunk = &buffer[..consumed];
        self.position += consumed as u64;

        let mut turns = Vec::new();
        for line in chunk.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok(Some(turn)) => turns.push(turn),
                Ok(None) => {}
                Err(reason) => {
                    tracing::warn!(path = %self.path.display(), %reason, "skipping malformed transcript line");
                }
            }
        }
        Ok(turns)
    }
}

fn parse_line(line: &[u8]) -> std::result::Result<Option<ParsedTurn>, String> {
    let raw: Value = serde_json::from_slice(line).map_err(|e| e.to_string())?;
    let record: TranscriptRecord =
        serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;

    let (actor, message_type, msg) = match record {
        TranscriptRecord::User(msg) => (TurnActor::User, "user", msg),
        TranscriptRecord::Assistant(msg) => (TurnActor::Agent, "assistant", msg),
        TranscriptRecord::Unknown => return Ok(None),
    };

    let (timestamp, timestamp_source) = match msg.timestamp.as_deref().and_then(parse_timestamp) {
        Some(ts) => (ts, TimestampSource::Jsonl),
        None => (Utc::now(), TimestampSource::Inferred),
    };

    let text = msg.message.content.flattened_text();
    let tool_input = msg.message.content.first_tool_input();

    Ok(Some(ParsedTurn {
        actor,
        text,
        timestamp,
        timestamp_source,
        raw,
        message_type: message_type.to_string(),
        is_internal: msg.is_meta || msg.is_sidechain,
        tool_input,
    }))
}

fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(path: &Path, lines: &[&str]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[test]
    fn reads_user_and_assistant_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        write_lines(
            &path,
            &[
                r#"{"type":"user","message":{"role":"user","content":"Fix login"},"timestamp":"2026-01-29T10:00:00Z"}"#,
                r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"On it."}]},"timestamp":"2026-01-29T10:00:05Z"}"#,
            ],
        );

        let mut reader = TranscriptReader::new(&path);
        let turns = reader.read_new_lines().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].actor, TurnActor::User);
        assert_eq!(turns[0].text, "Fix login");
        assert_eq!(turns[0].timestamp_source, TimestampSource::Jsonl);
        assert_eq!(turns[1].actor, TurnActor::Agent);
        assert_eq!(turns[1].text, "On it.");
    }

    #[test]
    fn resumes_from_offset_without_rereading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        write_lines(
            &path,
            &[r#"{"type":"user","message":{"content":"one"},"timestamp":"2026-01-29T10:00:00Z"}"#],
        );

        let mut reader = TranscriptReader::new(&path);
        assert_eq!(reader.read_new_lines().unwrap().len(), 1);
        assert_eq!(reader.read_new_lines().unwrap().len(), 0);

        write_lines(
            &path,
            &[r#"{"type":"user","message":{"content":"two"},"timestamp":"2026-01-29T10:01:00Z"}"#],
        );
        let turns = reader.read_new_lines().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "two");
    }

    #[test]
    fn partial_trailing_line_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"user\",\"message\":{\"content\":\"whole\"}}\n{\"type\":\"user\",\"mess",
        )
        .unwrap();

        let mut reader = TranscriptReader::new(&path);
        let turns = reader.read_new_lines().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "whole");

        // Finish the second line and it arrives on the next pass.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "age\":{{\"content\":\"rest\"}}}}\n").unwrap();
        let turns = reader.read_new_lines().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "rest");
    }

    #[test]
    fn malformed_and_non_message_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        write_lines(
            &path,
            &[
                "not json at all",
                r#"{"type":"progress","data":{}}"#,
                r#"{"type":"user","message":{"content":"kept"},"timestamp":"2026-01-29T10:00:00Z"}"#,
                r#"{"type":"file-history-snapshot","snapshot":{}}"#,
            ],
        );

        let mut reader = TranscriptReader::new(&path);
        let turns = reader.read_new_lines().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text, "kept");
    }

    #[test]
    fn sidechain_and_meta_messages_are_internal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        write_lines(
            &path,
            &[
                r#"{"type":"user","message":{"content":"protocol"},"isSidechain":true,"timestamp":"2026-01-29T10:00:00Z"}"#,
                r#"{"type":"user","message":{"content":"visible"},"timestamp":"2026-01-29T10:00:01Z"}"#,
            ],
        );

        let mut reader = TranscriptReader::new(&path);
        let turns = reader.read_new_lines().unwrap();
        assert!(turns[0].is_internal);
        assert!(!turns[1].is_internal);
    }

    #[test]
    fn missing_timestamp_falls_back_to_inferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        write_lines(&path, &[r#"{"type":"user","message":{"content":"hi"}}"#]);

        let mut reader = TranscriptReader::new(&path);
        let turns = reader.read_new_lines().unwrap();
        assert_eq!(turns[0].timestamp_source, TimestampSource::Inferred);
    }

    #[test]
    fn identical_entries_hash_identically() {
        let a = entry_hash(TurnActor::User, "same text");
        let b = entry_hash(TurnActor::User, "same text");
        let c = entry_hash(TurnActor::Agent, "same text");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
