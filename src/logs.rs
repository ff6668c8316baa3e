//! In-memory log transport.
//!
//! A bounded ring of recent [`LogEntry`]s. Every push is also published to
//! the broadcast layer as a `log` message so connected clients see it live.

use crate::broadcast::{Broadcaster, Message};
use crate::types::LogEntry;
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    broadcaster: Option<Broadcaster>,
}

impl LogBuffer {
    pub fn new(capacity: usize, broadcaster: Option<Broadcaster>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            broadcaster,
        }
    }

    pub fn push(&self, entry: LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        if let Some(ref broadcaster) = self.broadcaster {
            broadcaster.publish(Message::Log(entry));
        }
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.push(LogEntry::new("info", source, message));
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.push(LogEntry::new("error", source, message));
    }

    /// Up to `limit` most recent entries, oldest first
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let logs = LogBuffer::new(3, None);
        for i in 0..5 {
            logs.info("test", format!("line {i}"));
        }
        let recent: Vec<_> = logs.recent(10).into_iter().map(|e| e.message).collect();
        assert_eq!(recent, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(logs.recent(1)[0].message, "line 4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_is_broadcast() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        let logs = LogBuffer::new(10, Some(broadcaster.clone()));

        logs.error("llama-server", "boom");
        broadcaster.shutdown().await;

        let envelope: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(envelope["type"], "log");
        assert_eq!(envelope["data"]["message"], "boom");
        assert_eq!(envelope["data"]["level"], "error");
    }
}
