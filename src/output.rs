//! Output handling and buffering for supervised processes.
//!
//! This module provides the bounded per-service log buffer (`LogBuffer`), the
//! size-capped capture used by CLI tasks (`OutputCapture`), and text
//! sanitization used before readiness matching.

use std::collections::VecDeque;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strip_ansi_escapes::strip;

/// Marker appended once when captured CLI output hits its size cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// A single line in a service log.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    /// Output stream, or `None` for lifecycle lines written by the executor.
    pub stream: Option<StreamKind>,
    pub text: String,
}

impl LogLine {
    pub fn output(stream: StreamKind, text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            stream: Some(stream),
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            stream: None,
            text: text.into(),
        }
    }

    /// Renders the line as `<timestamp> [<source>] <text>`.
    pub fn render(&self) -> String {
        let source = self.stream.map(StreamKind::as_str).unwrap_or("system");
        format!(
            "{} [{}] {}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            source,
            self.text
        )
    }
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the number of lines currently in the buffer.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns an iterator over the lines in the buffer.
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// Renders the most recent `limit` lines (all when `None`), oldest first.
    pub fn tail(&self, limit: Option<usize>) -> Vec<String> {
        let skip = limit
            .map(|limit| self.lines.len().saturating_sub(limit))
            .unwrap_or(0);
        self.lines.iter().skip(skip).map(LogLine::render).collect()
    }
}

/// Captured stdout/stderr of a CLI task with a shared byte budget.
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    max_bytes: usize,
    used: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    /// Appends a chunk. Once the budget is spent, the truncation marker is
    /// written a single time and further chunks are discarded.
    pub fn append(&mut self, stream: StreamKind, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let target = match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        let remaining = self.max_bytes.saturating_sub(self.used);
        if chunk.len() <= remaining {
            target.extend_from_slice(chunk);
            self.used += chunk.len();
            return;
        }
        target.extend_from_slice(&chunk[..remaining]);
        trim_partial_char(target);
        target.extend_from_slice(TRUNCATION_MARKER.as_bytes());
        self.used = self.max_bytes;
        self.truncated = true;
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Sanitizes text for matching, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Drops a multi-byte UTF-8 sequence cut short at the end of `buf`.
fn trim_partial_char(buf: &mut Vec<u8>) {
    let tail_start = buf.len().saturating_sub(4);
    for start in (tail_start..buf.len()).rev() {
        let byte = buf[start];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            _ => 4,
        };
        if buf.len() - start < width {
            buf.truncate(start);
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(LogLine::output(StreamKind::Stdout, "a"));
        buffer.push(LogLine::output(StreamKind::Stdout, "b"));
        let dropped = buffer.push(LogLine::output(StreamKind::Stdout, "c"));
        assert!(dropped);
        let lines = buffer.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn tail_returns_most_recent_lines() {
        let mut buffer = LogBuffer::new(10);
        for i in 0..5 {
            buffer.push(LogLine::output(StreamKind::Stderr, format!("line {}", i)));
        }
        let tail = buffer.tail(Some(2));
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("[stderr] line 3"));
        assert!(tail[1].ends_with("[stderr] line 4"));
        assert_eq!(buffer.tail(None).len(), 5);
        assert_eq!(buffer.tail(Some(50)).len(), 5);
    }

    #[test]
    fn system_lines_are_tagged() {
        let line = LogLine::system("service started");
        assert!(line.render().ends_with("[system] service started"));
    }

    #[test]
    fn capture_truncates_once_across_streams() {
        let mut capture = OutputCapture::new(8);
        capture.append(StreamKind::Stdout, b"hello");
        capture.append(StreamKind::Stderr, b"world");
        capture.append(StreamKind::Stderr, b"more");
        assert!(capture.is_truncated());
        assert_eq!(capture.stdout(), "hello");
        assert_eq!(capture.stderr(), format!("wor{}", TRUNCATION_MARKER));
        capture.append(StreamKind::Stdout, b"ignored");
        assert_eq!(capture.stdout(), "hello");
    }

    #[test]
    fn truncation_keeps_whole_characters() {
        let mut capture = OutputCapture::new(2);
        capture.append(StreamKind::Stdout, "héllo".as_bytes());
        assert_eq!(capture.stdout(), format!("h{}", TRUNCATION_MARKER));

        // a character split across two reads
        let mut capture = OutputCapture::new(3);
        let bytes = "a€b".as_bytes();
        capture.append(StreamKind::Stdout, &bytes[..2]);
        capture.append(StreamKind::Stdout, &bytes[2..]);
        assert_eq!(capture.stdout(), format!("a{}", TRUNCATION_MARKER));
        assert!(!capture.stdout().contains('\u{fffd}'));
    }

    #[test]
    fn sanitize_strips_ansi() {
        let colored = "\u{1b}[32mReady\u{1b}[0m on 3000";
        assert_eq!(sanitize_text(colored, true), "Ready on 3000");
        assert_eq!(sanitize_text(colored, false), colored);
    }
}
