use crate::job::{LogEntry, LogLevel};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded log queue between a running provisioner and the update loop.
/// When full, the oldest lines are dropped and a warning takes their place
/// on the next drain.
pub struct LogBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    lines: VecDeque<LogEntry>,
    dropped: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity),
                dropped: 0,
            }),
            capacity,
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut inner = self.inner.lock();
        if inner.lines.len() == self.capacity {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        inner.lines.push_back(entry);
    }

    /// Takes up to `max` lines, oldest first. A drop warning is stamped
    /// with `now`.
    pub fn drain(&self, max: usize, now: DateTime<Utc>) -> Vec<LogEntry> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(max.min(inner.lines.len() + 1));

        if inner.dropped > 0 && max > 0 {
            out.push(LogEntry::new(
                now,
                LogLevel::Warn,
                "provisionerd",
                format!("{} log lines dropped, output was produced faster than it could be sent", inner.dropped),
            ));
            inner.dropped = 0;
        }
        while out.len() < max {
            match inner.lines.pop_front() {
                Some(line) => out.push(line),
                None => break,
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.lines.is_empty() && inner.dropped == 0
    }
}
