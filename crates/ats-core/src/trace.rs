//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Bounded log of transition checkpoints for operators."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

pub const TRACE_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Newest-first ring of human readable checkpoints. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct TraceLog {
    entries: Arc<Mutex<VecDeque<TraceEntry>>>,
    capacity: usize,
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::with_capacity(TRACE_CAPACITY)
    }
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        entries.push_front(TraceEntry {
            at: Utc::now(),
            message: message.into(),
        });
        entries.truncate(self.capacity);
    }

    /// Copy of the current entries, newest first.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_entries_within_capacity() {
        let log = TraceLog::new();
        for idx in 0..(TRACE_CAPACITY + 10) {
            log.push(format!("step {idx}"));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), TRACE_CAPACITY);
        assert_eq!(entries[0].message, format!("step {}", TRACE_CAPACITY + 9));
        assert_eq!(entries.last().unwrap().message, "step 10");
    }

    #[test]
    fn clones_share_the_buffer() {
        let log = TraceLog::with_capacity(3);
        let other = log.clone();
        other.push("boot");
        assert_eq!(log.len(), 1);
    }
}
