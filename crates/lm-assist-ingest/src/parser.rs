use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use crate::schema::SessionLine;
use lm_assist_types::{RawMessage, Result};

/// A parsed record together with its physical line index.
#[derive(Debug, Clone)]
pub struct IndexedRecord {
    pub line_index: u64,
    pub line: SessionLine,
}

/// Output of one incremental read.
///
/// `next_offset` sits immediately after the last complete newline consumed,
/// so a trailing partial line is re-read (whole) on the next call.
#[derive(Debug)]
pub struct RecordChunk {
    pub records: Vec<IndexedRecord>,
    pub next_offset: u64,
    pub next_line_index: u64,
    pub malformed: u64,
}

/// Raw (schema-loose) counterpart of [`RecordChunk`].
#[derive(Debug)]
pub struct RawChunk {
    pub messages: Vec<RawMessage>,
    pub next_offset: u64,
    pub next_line_index: u64,
    pub malformed: u64,
}

/// Read typed records starting at `byte_offset`, numbering physical lines
/// from `first_line_index`. Malformed lines are skipped and counted, never
/// fatal: the file is live-appended and a truncated tail is expected.
pub fn read_records(path: &Path, byte_offset: u64, first_line_index: u64) -> Result<RecordChunk> {
    let (buf, consumed) = read_complete_lines(path, byte_offset)?;

    let mut records = Vec::new();
    let mut line_index = first_line_index;
    let mut malformed = 0u64;

    for line in split_lines(&buf) {
        let trimmed = trim_line(line);
        if !trimmed.is_empty() {
            match serde_json::from_slice::<SessionLine>(trimmed) {
                Ok(parsed) => records.push(IndexedRecord {
                    line_index,
                    line: parsed,
                }),
                Err(err) => {
                    malformed += 1;
                    if malformed == 1 || malformed % 100 == 0 {
                        warn!(
                            path = %path.display(),
                            line = line_index,
                            skipped = malformed,
                            "skipping malformed session line: {}",
                            err
                        );
                    }
                }
            }
        }
        line_index += 1;
    }

    Ok(RecordChunk {
        records,
        next_offset: byte_offset + consumed,
        next_line_index: line_index,
        malformed,
    })
}

/// Read raw JSON values starting at `byte_offset`; same line accounting as
/// [`read_records`] so both caches stay aligned on indexes.
pub fn read_raw(path: &Path, byte_offset: u64, first_line_index: u64) -> Result<RawChunk> {
    let (buf, consumed) = read_complete_lines(path, byte_offset)?;

    let mut messages = Vec::new();
    let mut line_index = first_line_index;
    let mut malformed = 0u64;

    for line in split_lines(&buf) {
        let trimmed = trim_line(line);
        if !trimmed.is_empty() {
            match serde_json::from_slice::<Value>(trimmed) {
                Ok(json) => {
                    let record_type = json
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    let timestamp = json
                        .get("timestamp")
                        .and_then(|t| t.as_str())
                        .and_then(parse_timestamp);
                    messages.push(RawMessage {
                        line_index,
                        record_type,
                        timestamp,
                        json,
                    });
                }
                Err(_) => malformed += 1,
            }
        }
        line_index += 1;
    }

    Ok(RawChunk {
        messages,
        next_offset: byte_offset + consumed,
        next_line_index: line_index,
        malformed,
    })
}

/// Parse an RFC 3339 timestamp, tolerating the occasional missing offset.
pub fn parse_timestamp(ts: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .ok()
}

/// Read everything from `byte_offset` up to (and including) the last
/// complete newline. Returns the buffer and the byte count consumed.
/// Transient read errors are retried once.
fn read_complete_lines(path: &Path, byte_offset: u64) -> Result<(Vec<u8>, u64)> {
    let buf = match read_from(path, byte_offset) {
        Ok(buf) => buf,
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ) =>
        {
            read_from(path, byte_offset)?
        }
        Err(err) => return Err(err.into()),
    };

    // Only consume up to the last newline; partial trailing bytes wait for
    // the next append.
    match buf.iter().rposition(|&b| b == b'\n') {
        Some(last_newline) => {
            let consumed = (last_newline + 1) as u64;
            let mut complete = buf;
            complete.truncate(last_newline + 1);
            Ok((complete, consumed))
        }
        None => Ok((Vec::new(), 0)),
    }
}

fn read_from(path: &Path, byte_offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    if byte_offset > 0 {
        file.seek(SeekFrom::Start(byte_offset))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Split on newlines, keeping empty lines (they still consume a line
/// index). The buffer always ends at a newline, so the empty tail segment
/// produced by `split` is dropped.
fn split_lines(buf: &[u8]) -> std::vec::IntoIter<&[u8]> {
    let mut parts: Vec<&[u8]> = buf.split(|&b| b == b'\n').collect();
    if parts.last().is_some_and(|l| l.is_empty()) {
        parts.pop();
    }
    parts.into_iter()
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_from_zero() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_file(
            &dir,
            "s.jsonl",
            "{\"type\":\"user\",\"message\":{\"role\":\"user\",\"content\":\"hi\"}}\n{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hello\"}]}}\n",
        );

        let chunk = read_records(&path, 0, 0)?;
        assert_eq!(chunk.records.len(), 2);
        assert_eq!(chunk.records[0].line_index, 0);
        assert_eq!(chunk.records[1].line_index, 1);
        assert_eq!(chunk.malformed, 0);
        assert_eq!(chunk.next_line_index, 2);
        assert_eq!(chunk.next_offset, path.metadata()?.len());
        Ok(())
    }

    #[test]
    fn test_partial_trailing_line_not_consumed() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let complete = "{\"type\":\"user\",\"message\":{\"role\":\"user\",\"content\":\"hi\"}}\n";
        let partial = "{\"type\":\"assist";
        let path = write_file(&dir, "s.jsonl", &format!("{}{}", complete, partial));

        let chunk = read_records(&path, 0, 0)?;
        assert_eq!(chunk.records.len(), 1);
        assert_eq!(chunk.next_offset, complete.len() as u64);
        assert_eq!(chunk.malformed, 0);

        // Complete the line and resume: the parser consumes it now.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path)?;
        f.write_all(b"ant\",\"message\":{\"content\":[]}}\n")?;
        let next = read_records(&path, chunk.next_offset, chunk.next_line_index)?;
        assert_eq!(next.records.len(), 1);
        assert_eq!(next.records[0].line_index, 1);
        Ok(())
    }

    #[test]
    fn test_malformed_lines_skipped_and_counted() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_file(
            &dir,
            "s.jsonl",
            "not json at all\n{\"type\":\"summary\",\"summary\":\"ok\"}\n{broken\n",
        );

        let chunk = read_records(&path, 0, 0)?;
        assert_eq!(chunk.records.len(), 1);
        assert_eq!(chunk.malformed, 2);
        // Valid record keeps its physical line index.
        assert_eq!(chunk.records[0].line_index, 1);
        Ok(())
    }

    #[test]
    fn test_resume_equivalence() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let lines: Vec<String> = (0..5)
            .map(|i| {
                format!(
                    "{{\"type\":\"user\",\"message\":{{\"role\":\"user\",\"content\":\"m{}\"}}}}",
                    i
                )
            })
            .collect();
        let content = format!("{}\n", lines.join("\n"));
        let path = write_file(&dir, "s.jsonl", &content);

        let full = read_records(&path, 0, 0)?;
        assert_eq!(full.records.len(), 5);

        // Parse [0, o) then resume from o: identical records in order.
        let o = (lines[0].len() + 1 + lines[1].len() + 1) as u64;
        let resumed = read_records(&path, o, 2)?;
        assert_eq!(resumed.records.len(), 3);
        for (a, b) in full.records[2..].iter().zip(resumed.records.iter()) {
            assert_eq!(a.line_index, b.line_index);
        }
        assert_eq!(resumed.next_offset, full.next_offset);
        assert_eq!(resumed.next_line_index, full.next_line_index);
        Ok(())
    }

    #[test]
    fn test_raw_alignment_with_records() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_file(
            &dir,
            "s.jsonl",
            "{\"type\":\"user\",\"timestamp\":\"2026-01-01T00:00:00Z\",\"message\":{\"role\":\"user\",\"content\":\"hi\"}}\n",
        );

        let records = read_records(&path, 0, 0)?;
        let raw = read_raw(&path, 0, 0)?;
        assert_eq!(records.records.len(), raw.messages.len());
        assert_eq!(raw.messages[0].record_type, "user");
        assert_eq!(raw.messages[0].line_index, 0);
        assert!(raw.messages[0].timestamp.is_some());
        assert_eq!(raw.next_offset, records.next_offset);
        Ok(())
    }

    #[test]
    fn test_empty_file() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_file(&dir, "s.jsonl", "");
        let chunk = read_records(&path, 0, 0)?;
        assert!(chunk.records.is_empty());
        assert_eq!(chunk.next_offset, 0);
        assert_eq!(chunk.next_line_index, 0);
        Ok(())
    }
}
