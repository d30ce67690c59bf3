//! Bounded, sequence-indexed record of everything the supervised program and the supervisor
//! itself print.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::OnceLock;

pub const DEFAULT_LOG_MAX_SIZE: usize = 10_000;

/// Terminal color and cursor sequences, OSC titles and the C0 controls except tab and newline.
const CONTROL_SEQUENCES: &str =
    r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]|[\x00-\x08\x0b-\x1f\x7f]";

fn control_sequences() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CONTROL_SEQUENCES).expect("control sequence regex must compile"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Internal,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
            LogStream::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogStream,
    /// Line text with the trailing `\n` kept when the fragment had one.
    pub text: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRing {
    max_size: usize,
    next_sequence: u64,
    entries: VecDeque<LogEntry>,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_MAX_SIZE)
    }
}

impl LogRing {
    /// A `max_size` of zero is bumped to one, an empty ring could never retain the latest write.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            next_sequence: 0,
            entries: VecDeque::new(),
        }
    }

    /// Splits `bytes` into lines, strips control sequences and stores one entry per non-empty
    /// fragment. Returns the number of entries added.
    pub fn append(&mut self, stream: LogStream, bytes: &[u8]) -> usize {
        let decoded = String::from_utf8_lossy(bytes);
        let mut added = 0;
        for fragment in decoded.split_inclusive('\n') {
            let text = control_sequences().replace_all(fragment, "");
            if text.is_empty() {
                continue;
            }
            self.push(stream, text.into_owned());
            added += 1;
        }
        added
    }

    fn push(&mut self, stream: LogStream, text: String) {
        self.entries.push_back(LogEntry {
            stream,
            text,
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, sequence: u64) -> Option<&LogEntry> {
        let first = self.first_sequence()?;
        let index = usize::try_from(sequence.checked_sub(first)?).ok()?;
        self.entries.get(index)
    }

    /// Sequence of the oldest retained entry.
    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.front().map(|e| e.sequence)
    }

    /// Sequence the next appended entry will get. Equal to the number of entries ever stored.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Retained entries with a sequence number greater or equal than `sequence`.
    pub fn since(&self, sequence: u64) -> impl Iterator<Item = &LogEntry> {
        let skip = self
            .first_sequence()
            .map(|first| sequence.saturating_sub(first))
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(usize::MAX);
        self.entries.iter().skip(skip)
    }
}
