use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};

/// Entries kept before the oldest are dropped.
pub const ACTIVITY_CAP: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    pub at: DateTime<Local>,
    pub worker: Option<String>,
    pub message: String,
}

impl fmt::Display for ActivityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.at.format("%H:%M:%S");
        match &self.worker {
            Some(worker) => write!(f, "[{time}] {worker}: {}", self.message),
            None => write!(f, "[{time}] {}", self.message),
        }
    }
}

/// Short human-readable lines about what the scheduler did.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    cap: usize,
    unread: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(ACTIVITY_CAP)
    }
}

impl ActivityLog {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
            unread: 0,
        }
    }

    pub fn push(&mut self, worker: Option<&str>, message: impl Into<String>) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(ActivityEntry {
            at: Local::now(),
            worker: worker.map(str::to_string),
            message: message.into(),
        });
        self.unread = (self.unread + 1).min(self.entries.len());
    }

    /// Entries added since the last call.
    pub fn take_new(&mut self) -> Vec<ActivityEntry> {
        let skip = self.entries.len() - self.unread;
        self.unread = 0;
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_new_returns_unread_only() {
        let mut log = ActivityLog::default();
        log.push(Some("worker-1"), "started t-1");
        log.push(None, "quota refreshed");
        let first = log.take_new();
        assert_eq!(first.len(), 2);
        assert!(first[0].to_string().ends_with("worker-1: started t-1"));
        assert!(log.take_new().is_empty());

        log.push(Some("worker-2"), "completed t-2");
        let next = log.take_new();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].message, "completed t-2");
    }

    #[test]
    fn cap_evicts_oldest() {
        let mut log = ActivityLog::with_capacity(2);
        for i in 0..5 {
            log.push(None, format!("line {i}"));
        }
        assert_eq!(log.len(), 2);
        let lines: Vec<_> = log.take_new().into_iter().map(|e| e.message).collect();
        assert_eq!(lines, vec!["line 3", "line 4"]);
    }
}
