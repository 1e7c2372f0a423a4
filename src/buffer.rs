//! Bounded in-memory capture of worker session output.

use std::collections::VecDeque;

/// Marker line inserted once at the front when old output has been
/// dropped to stay within the byte budget.
pub const TRUNCATION_MARKER: &str = "[... earlier output truncated ...]";

/// Byte-bounded ring of output lines.
///
/// Holds the most recent lines whose combined length fits the budget.
/// Eviction pops whole lines from the front, so appends and evictions
/// are both O(1) amortized regardless of how much output a runaway
/// worker produces. The full transcript lives in the session log file;
/// this buffer only backs live inspection.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        let mut line = line.into();
        let len = line.len();

        // A single line at or over the whole budget evicts everything
        // else and keeps only its trailing bytes, the most recent
        // output, so the buffer never exceeds the budget.
        if len >= self.max_bytes {
            let mut cut = len - self.max_bytes;
            while !line.is_char_boundary(cut) {
                cut += 1;
            }
            let tail = line.split_off(cut);
            self.lines.clear();
            self.bytes = tail.len();
            self.lines.push_back(tail);
            self.truncated = true;
            return;
        }

        self.lines.push_back(line);
        self.bytes += len;

        while self.bytes > self.max_bytes {
            if let Some(evicted) = self.lines.pop_front() {
                self.bytes -= evicted.len();
                self.truncated = true;
            } else {
                break;
            }
        }
    }

    /// Whether any lines have been evicted.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Retained lines, oldest first, preceded by a single truncation
    /// marker if anything was evicted.
    pub fn lines(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.lines.len() + 1);
        if self.truncated {
            out.push(TRUNCATION_MARKER);
        }
        out.extend(self.lines.iter().map(|s| s.as_str()));
        out
    }

    pub fn contents(&self) -> String {
        self.lines().join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.bytes = 0;
        self.truncated = false;
    }
}
