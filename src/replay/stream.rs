//! Streaming JSONL Reader
//!
//! Lazy, restartable sequence of parsed records over one append-only
//! newline-delimited file. Reads fixed-size byte chunks, splits on LF/CRLF,
//! and hands each non-blank line to a caller-supplied parser. The reader is
//! single-pass and never seeks; the scheduler owns exactly one reader per
//! file and multiplexes at its own level.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default chunk size for file reads (overridable via env, see `config`).
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;
/// Default number of parsed records buffered ahead of the consumer.
pub const DEFAULT_BUFFER_LINES: usize = 2_000;

/// Tuning for one reader instance.
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    pub chunk_bytes: usize,
    pub buffer_lines: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            buffer_lines: DEFAULT_BUFFER_LINES,
        }
    }
}

/// Line parser: maps one trimmed, non-empty line to a record.
pub type LineParser<T> = Box<dyn FnMut(&str) -> Result<T> + Send>;

/// Chunked single-pass reader over a newline-delimited record file.
///
/// Parse failures increment a counter but are reported at most once per
/// reader; subsequent bad lines are skipped silently.
pub struct JsonlReader<T> {
    path: PathBuf,
    file: Option<File>,
    /// Raw bytes of the trailing partial line from the previous chunk.
    carry: Vec<u8>,
    records: VecDeque<T>,
    parser: LineParser<T>,
    chunk_bytes: usize,
    buffer_lines: usize,
    at_eof: bool,
    parse_failures: u64,
    failure_reported: bool,
}

impl<T> JsonlReader<T> {
    /// Open a reader with an explicit parser. Open failure is fatal to the
    /// caller (the owning market/coin is dropped upstream).
    pub fn open(path: impl AsRef<Path>, config: ReaderConfig, parser: LineParser<T>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("failed to open record file {}", path.display()))?;
        Ok(Self {
            path,
            file: Some(file),
            carry: Vec::new(),
            records: VecDeque::new(),
            parser,
            chunk_bytes: config.chunk_bytes.max(1),
            buffer_lines: config.buffer_lines.max(1),
            at_eof: false,
            parse_failures: 0,
            failure_reported: false,
        })
    }

    /// Next record without consuming it.
    pub fn peek(&mut self) -> Option<&T> {
        self.fill();
        self.records.front()
    }

    /// Consume and return the next record.
    pub fn shift(&mut self) -> Option<T> {
        self.fill();
        self.records.pop_front()
    }

    /// Release the file descriptor and drop any buffered records. A closed
    /// reader yields nothing forever; it is never re-opened.
    pub fn close(&mut self) {
        self.file = None;
        self.at_eof = true;
        self.carry.clear();
        self.records.clear();
    }

    /// Count of lines the parser rejected so far.
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fill(&mut self) {
        while self.records.len() < self.buffer_lines && !self.at_eof {
            let Some(file) = self.file.as_mut() else {
                self.at_eof = true;
                break;
            };
            let mut chunk = vec![0u8; self.chunk_bytes];
            match file.read(&mut chunk) {
                Ok(0) => {
                    self.at_eof = true;
                    self.file = None;
                    // Flush the trailing partial line, if any.
                    if !self.carry.is_empty() {
                        let line = std::mem::take(&mut self.carry);
                        self.parse_line(&line);
                    }
                }
                Ok(n) => {
                    self.carry.extend_from_slice(&chunk[..n]);
                    self.drain_complete_lines();
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "record file read error, treating as EOF");
                    self.at_eof = true;
                    self.file = None;
                }
            }
        }
    }

    fn drain_complete_lines(&mut self) {
        let mut start = 0usize;
        while let Some(rel) = self.carry[start..].iter().position(|&b| b == b'\n') {
            let end = start + rel;
            let line: Vec<u8> = self.carry[start..end].to_vec();
            self.parse_line(&line);
            start = end + 1;
        }
        if start > 0 {
            self.carry.drain(..start);
        }
    }

    fn parse_line(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r').trim();
        if line.is_empty() {
            return;
        }
        match (self.parser)(line) {
            Ok(record) => self.records.push_back(record),
            Err(err) => {
                self.parse_failures += 1;
                if !self.failure_reported {
                    self.failure_reported = true;
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "skipping unparseable line (further failures in this file are silent)"
                    );
                }
            }
        }
    }
}

impl<T: DeserializeOwned + 'static> JsonlReader<T> {
    /// Convenience constructor parsing each line as JSON into `T`.
    pub fn open_json(path: impl AsRef<Path>, config: ReaderConfig) -> Result<Self> {
        Self::open(
            path,
            config,
            Box::new(|line| serde_json::from_str::<T>(line).map_err(Into::into)),
        )
    }
}

impl<T> std::fmt::Debug for JsonlReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlReader")
            .field("path", &self.path)
            .field("buffered", &self.records.len())
            .field("at_eof", &self.at_eof)
            .field("parse_failures", &self.parse_failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::types::{Millis, Tick};
    use std::io::Write;

    fn write_fixture(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn tiny_config() -> ReaderConfig {
        // Force many small chunk reads to exercise the carry path.
        ReaderConfig {
            chunk_bytes: 7,
            buffer_lines: 2,
        }
    }

    #[test]
    fn test_peek_then_shift() {
        let file = write_fixture(&[
            r#"{"timestamp":1,"value":10.0}"#,
            r#"{"timestamp":2,"value":20.0}"#,
        ]);
        let mut reader: JsonlReader<Tick> = JsonlReader::open_json(file.path(), tiny_config()).unwrap();
        assert_eq!(reader.peek().unwrap().timestamp, 1);
        assert_eq!(reader.shift().unwrap().timestamp, 1);
        assert_eq!(reader.shift().unwrap().timestamp, 2);
        assert!(reader.shift().is_none());
        assert!(reader.peek().is_none());
    }

    #[test]
    fn test_crlf_blank_lines_and_trailing_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // CRLF endings, a blank line, and a final line with no newline.
        write!(
            file,
            "{}\r\n\r\n{}",
            r#"{"timestamp":1,"value":1.0}"#, r#"{"timestamp":2,"value":2.0}"#
        )
        .unwrap();
        file.flush().unwrap();
        let mut reader: JsonlReader<Tick> = JsonlReader::open_json(file.path(), tiny_config()).unwrap();
        assert_eq!(reader.shift().unwrap().timestamp, 1);
        assert_eq!(reader.shift().unwrap().timestamp, 2);
        assert!(reader.shift().is_none());
    }

    #[test]
    fn test_bad_lines_skipped_and_counted() {
        let file = write_fixture(&[
            r#"{"timestamp":1,"value":1.0}"#,
            "not json at all",
            r#"{"timestamp":"bogus"}"#,
            r#"{"timestamp":3,"value":3.0}"#,
        ]);
        let mut reader: JsonlReader<Tick> = JsonlReader::open_json(file.path(), ReaderConfig::default()).unwrap();
        let got: Vec<Millis> = std::iter::from_fn(|| reader.shift()).map(|t| t.timestamp).collect();
        assert_eq!(got, vec![1, 3]);
        assert_eq!(reader.parse_failures(), 2);
    }

    #[test]
    fn test_close_is_terminal() {
        let file = write_fixture(&[r#"{"timestamp":1,"value":1.0}"#]);
        let mut reader: JsonlReader<Tick> = JsonlReader::open_json(file.path(), ReaderConfig::default()).unwrap();
        reader.close();
        assert!(reader.shift().is_none());
    }

    #[test]
    fn test_open_missing_file_is_error() {
        let result: Result<JsonlReader<Tick>> =
            JsonlReader::open_json("/definitely/not/here.jsonl", ReaderConfig::default());
        assert!(result.is_err());
    }
}
