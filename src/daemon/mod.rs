//! Event Bus and Log Ring Buffer: the two collaborator interfaces an
//! external daemon process consumes to turn engine events into a
//! WebSocket/HTTP stream. This crate does not implement that framing layer
//! itself — only the library types a daemon wraps.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use ralph_common::event::Event;
use ralph_common::RalphError;

/// Which name a subscriber filters by. A PRD and its worktree share a name
/// in this crate's one-worktree-per-PRD model, so both variants resolve to
/// the same underlying channel — the distinction exists so callers can
/// address either.
#[derive(Debug, Clone)]
pub enum Subscription {
    Prd(String),
    Worktree(String),
}

impl Subscription {
    fn channel_key(&self) -> &str {
        match self {
            Subscription::Prd(name) | Subscription::Worktree(name) => name,
        }
    }
}

/// Per-run broadcast channels keyed by PRD name. A slow subscriber falls
/// behind rather than blocking the publisher: `tokio::sync::broadcast`'s
/// ring buffer evicts the oldest unread event once a lagging receiver's
/// backlog exceeds `capacity`, giving drop-oldest backpressure for free.
pub struct EventBus {
    capacity: usize,
    channels: Mutex<HashMap<String, tokio::sync::broadcast::Sender<Event>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, channels: Mutex::new(HashMap::new()) }
    }

    fn sender_for(&self, prd: &str) -> tokio::sync::broadcast::Sender<Event> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(prd.to_string())
            .or_insert_with(|| tokio::sync::broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish one event to its PRD's channel. A no-op (not an error) when
    /// nobody is subscribed yet.
    pub fn publish(&self, event: Event) {
        let sender = self.sender_for(&event.prd);
        let _ = sender.send(event);
    }

    pub fn subscribe(&self, filter: Subscription) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender_for(filter.channel_key()).subscribe()
    }
}

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Per-PRD bounded ring of recent log lines, mirrored append-only to a log
/// file so history survives process restarts and ring eviction.
pub struct LogRingBuffer {
    capacity: usize,
    log_path: PathBuf,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRingBuffer {
    pub fn new(log_path: PathBuf, capacity: usize) -> Self {
        Self { capacity, log_path, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn push(&self, line: impl Into<String>) -> Result<(), RalphError> {
        let entry = LogEntry { timestamp: Utc::now(), line: line.into() };

        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RalphError::Io { path: parent.to_path_buf(), source })?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|source| RalphError::Io { path: self.log_path.clone(), source })?;
        writeln!(file, "{}\t{}", entry.timestamp.to_rfc3339(), entry.line)
            .map_err(|source| RalphError::Io { path: self.log_path.clone(), source })?;

        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    /// All buffered entries; rehydrated from the log file when the
    /// in-memory ring is empty (e.g. a freshly started daemon).
    pub fn get_all(&self) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap();
        if !entries.is_empty() {
            return entries.iter().cloned().collect();
        }
        drop(entries);
        self.rehydrate()
    }

    pub fn get_tail(&self, n: usize) -> Vec<LogEntry> {
        let all = self.get_all();
        let start = all.len().saturating_sub(n);
        all[start..].to_vec()
    }

    pub fn clear(&self) -> Result<(), RalphError> {
        self.entries.lock().unwrap().clear();
        match std::fs::remove_file(&self.log_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RalphError::Io { path: self.log_path.clone(), source }),
        }
    }

    fn rehydrate(&self) -> Vec<LogEntry> {
        let Ok(raw) = std::fs::read_to_string(&self.log_path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| {
                let (ts, text) = line.split_once('\t')?;
                let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
                Some(LogEntry { timestamp, line: text.to_string() })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ralph_common::event::EventKind;

    #[tokio::test]
    async fn bus_delivers_to_subscriber_of_matching_prd() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe(Subscription::Prd("alpha".to_string()));
        bus.publish(Event::new(0, "alpha", EventKind::Complete { outcome: "ok".to_string() }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.prd, "alpha");
    }

    #[tokio::test]
    async fn bus_does_not_cross_deliver_between_prds() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe(Subscription::Prd("alpha".to_string()));
        bus.publish(Event::new(0, "beta", EventKind::Complete { outcome: "ok".to_string() }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ring_buffer_push_and_get_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ring = LogRingBuffer::new(dir.path().join("alpha.log"), 3);
        for i in 0..5 {
            ring.push(format!("line {i}")).unwrap();
        }
        let tail = ring.get_tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].line, "line 4");
    }

    #[test]
    fn ring_buffer_rehydrates_from_file_when_memory_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.log");
        {
            let ring = LogRingBuffer::new(path.clone(), 10);
            ring.push("persisted line").unwrap();
        }
        let ring = LogRingBuffer::new(path, 10);
        let all = ring.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].line, "persisted line");
    }

    #[test]
    fn ring_buffer_clear_removes_file_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let ring = LogRingBuffer::new(dir.path().join("alpha.log"), 10);
        ring.push("line").unwrap();
        ring.clear().unwrap();
        assert!(ring.get_all().is_empty());
    }
}
