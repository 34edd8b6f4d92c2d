use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A single log line plus the instant it was read. Bytes keep the
/// trailing newline when the input had one.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub line: Vec<u8>,
    pub when: DateTime<Utc>,
}

impl LogLine {
    pub fn new(line: Vec<u8>, when: DateTime<Utc>) -> Self {
        Self { line, when }
    }
}

/// An ordered collection of log lines delivered as a single HTTP
/// request. Built by one reader, then handed off exactly once; after
/// hand-off it is read-only.
#[derive(Debug)]
pub struct Batch {
    pub id: Uuid,
    pub opened_at: DateTime<Utc>,
    lines: Vec<LogLine>,
    byte_size: usize,
    max_size: usize,
}

impl Batch {
    pub fn new(max_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Utc::now(),
            lines: Vec::with_capacity(max_size),
            byte_size: 0,
            max_size,
        }
    }

    /// Append a line. Returns true when the batch has reached capacity
    /// and must be sealed.
    pub fn add(&mut self, line: LogLine) -> bool {
        self.byte_size += line.line.len();
        self.lines.push(line);
        self.lines.len() >= self.max_size
    }

    pub fn msg_count(&self) -> usize {
        self.lines.len()
    }

    /// Raw payload bytes; frame headers added by a formatter are not
    /// included.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }
}
