//! Circular log of operator-facing messages, read back with `MESSAGE [n]`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Number of entries kept before the oldest is dropped.
pub const MESSAGE_LOG_CAPACITY: usize = 512;

/// Bounded message history.
#[derive(Debug, Clone)]
pub struct MessageLog {
    entries: VecDeque<String>,
}

impl MessageLog {
    /// Empty log.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(MESSAGE_LOG_CAPACITY),
        }
    }

    /// Append a message stamped `dd.mm. HH:MM:SS` (UTC).
    pub fn push(&mut self, at: DateTime<Utc>, msg: &str) {
        if self.entries.len() == MESSAGE_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries
            .push_back(format!("{} {}\n", at.format("%d.%m. %H:%M:%S"), msg));
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing was logged yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the last `count` entries (all when `None`) followed by `+OK`.
    pub fn render_last(&self, count: Option<usize>) -> String {
        let skip = count.map_or(0, |n| self.entries.len().saturating_sub(n));
        let mut out: String = self.entries.iter().skip(skip).map(String::as_str).collect();
        out.push_str("+OK");
        out
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 21, 4, 5).unwrap()
    }

    #[test]
    fn test_entry_format() {
        let mut log = MessageLog::new();
        log.push(at(), "expose started");
        assert_eq!(log.render_last(None), "07.03. 21:04:05 expose started\n+OK");
    }

    #[test]
    fn test_render_last_n() {
        let mut log = MessageLog::new();
        for i in 0..5 {
            log.push(at(), &format!("msg {i}"));
        }
        let out = log.render_last(Some(2));
        assert!(out.contains("msg 3"));
        assert!(out.contains("msg 4"));
        assert!(!out.contains("msg 2"));
        assert!(out.ends_with("+OK"));

        // Asking for more than exists returns everything.
        assert_eq!(log.render_last(Some(100)), log.render_last(None));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut log = MessageLog::new();
        for i in 0..(MESSAGE_LOG_CAPACITY + 3) {
            log.push(at(), &format!("msg {i}"));
        }
        assert_eq!(log.len(), MESSAGE_LOG_CAPACITY);
        let out = log.render_last(None);
        assert!(!out.contains("msg 2\n"));
        assert!(out.contains("msg 3\n"));
    }

    #[test]
    fn test_empty_log() {
        let log = MessageLog::default();
        assert!(log.is_empty());
        assert_eq!(log.render_last(Some(3)), "+OK");
    }
}
