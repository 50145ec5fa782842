//! Bounded per-instance console history.
//!
//! Records get strictly increasing sequence numbers starting at 1. A reader
//! passes the last sequence it has seen (`since`) and gets everything newer.
//! When the buffer is full the oldest records are evicted first; a reader that
//! fell behind the eviction point simply receives the oldest retained window.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::utils::current_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Sequence number, the `since` cursor for polling.
    pub seq: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub stream: LogStream,
    pub line: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

pub struct LogBuffer {
    records: VecDeque<LogRecord>,
    next_seq: u64,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(4096)),
            next_seq: 1,
            capacity,
        }
    }

    /// Store a line tagged as info. See [`LogBuffer::append_with_level`].
    pub fn append(&mut self, line: impl Into<String>, stream: LogStream) -> LogRecord {
        self.append_with_level(line, stream, LogLevel::Info)
    }

    pub fn append_with_level(
        &mut self,
        line: impl Into<String>,
        stream: LogStream,
        level: LogLevel,
    ) -> LogRecord {
        let record = LogRecord {
            seq: self.next_seq,
            timestamp: current_timestamp(),
            stream,
            line: line.into(),
            level,
        };
        self.next_seq += 1;

        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record.clone());
        record
    }

    /// Records with `seq > since`, oldest first.
    pub fn read(&self, since: u64) -> Vec<LogRecord> {
        let Some(first) = self.records.front().map(|r| r.seq) else {
            return Vec::new();
        };
        // sequence numbers are contiguous inside the deque
        let skip = since.saturating_add(1).saturating_sub(first);
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// The newest `count` records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<LogRecord> {
        let skip = self.records.len().saturating_sub(count);
        self.records.iter().skip(skip).cloned().collect()
    }

    /// Sequence of the newest record, 0 when nothing was ever appended.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Extract the level from a console line using an optional regex with a
/// `level` capture group. Without a pattern or a match, lines are info.
///
/// Example pattern for `[12:00:00] [Server thread/WARN]: ...`:
///   `/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]`
pub fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(level_match) = re.captures(line).and_then(|caps| caps.name("level")) {
            return match level_match.as_str().to_uppercase().as_str() {
                "ERROR" | "FATAL" | "SEVERE" => LogLevel::Error,
                "WARN" | "WARNING" => LogLevel::Warn,
                "DEBUG" | "TRACE" => LogLevel::Debug,
                _ => LogLevel::Info,
            };
        }
    }
    LogLevel::Info
}
