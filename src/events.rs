//! Per-run event buffer (C9, §4.9).
//!
//! Single-writer (the orchestrator owning a `run_hash`), many-reader.
//! Monotonic ids starting at 1, never reused, never reordered — the same
//! single-writer/append-only discipline `backtest_v2::queue` uses for its
//! event sequence, adapted here from an in-memory simulation queue to an
//! API-facing log with snapshot (`ETag`) and live-stream (SSE, resumable
//! via `Last-Event-ID`) read modes.

use std::collections::VecDeque;

use tokio::sync::broadcast;

use crate::domain::{Event, EventType};

/// Never evict below this many trailing events, per §4.9 Capacity.
pub const MIN_RETAINED: usize = 256;

/// Heartbeat cadence for stream mode.
pub const HEARTBEAT_SECS: u64 = 15;

/// Append-only per-run event log plus a broadcast channel for live
/// subscribers. Appends happen only through the orchestrator that owns
/// this run's `run_hash`; reads (snapshot or stream) are unrestricted.
pub struct EventBuffer {
    run_hash: String,
    events: VecDeque<Event>,
    next_id: u64,
    sender: broadcast::Sender<Event>,
}

impl EventBuffer {
    pub fn new(run_hash: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(MIN_RETAINED.max(64));
        Self {
            run_hash: run_hash.into(),
            events: VecDeque::new(),
            next_id: 1,
            sender,
        }
    }

    /// Append a new event, assigning the next monotonic id. Broadcasts to
    /// any live stream subscribers; a lagging or absent subscriber never
    /// blocks the writer (`broadcast::Sender::send` is non-blocking and a
    /// full channel drops the oldest unread message for slow readers).
    pub fn push(&mut self, event_type: EventType, payload: serde_json::Value, ts: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let event = Event {
            run_hash: self.run_hash.clone(),
            id,
            ts: ts.into(),
            event_type,
            payload,
        };
        self.events.push_back(event.clone());
        self.trim();
        // A broadcast error just means there are currently no subscribers.
        let _ = self.sender.send(event);
        id
    }

    fn trim(&mut self) {
        while self.events.len() > MIN_RETAINED && self.events.len() > self.min_live_window() {
            self.events.pop_front();
        }
    }

    /// Conservative floor: never drop below `MIN_RETAINED`, regardless of
    /// how many events have been pushed.
    fn min_live_window(&self) -> usize {
        MIN_RETAINED
    }

    pub fn last_id(&self) -> u64 {
        self.next_id - 1
    }

    pub fn etag(&self) -> String {
        format!("{}:{}", self.run_hash, self.last_id())
    }

    /// Snapshot mode (§4.9): all events with `id > after_id`, plus the
    /// current `ETag`. `after_id = 0` returns everything still retained.
    pub fn snapshot(&self, after_id: u64) -> (Vec<Event>, String) {
        let events = self
            .events
            .iter()
            .filter(|e| e.id > after_id)
            .cloned()
            .collect();
        (events, self.etag())
    }

    /// Whether a conditional `If-None-Match` header matches the current
    /// `ETag` (caller should respond not-modified in that case).
    pub fn etag_matches(&self, if_none_match: &str) -> bool {
        if_none_match == self.etag()
    }

    /// Backlog to replay for a stream subscriber resuming from
    /// `Last-Event-ID`. Returns events strictly after `last_event_id`, in
    /// ascending order, drawn from whatever is still retained — a
    /// subscriber resuming past the retention window misses nothing that
    /// wasn't already evicted (spec's capacity guarantee is a floor, not a
    /// promise of unbounded history).
    pub fn backlog_since(&self, last_event_id: u64) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.id > last_event_id)
            .cloned()
            .collect()
    }

    /// Subscribe for live (post-backlog) events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn run_hash(&self) -> &str {
        &self.run_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> serde_json::Value {
        serde_json::json!({})
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut buf = EventBuffer::new("abc");
        let id1 = buf.push(EventType::Started, payload(), "t0");
        let id2 = buf.push(EventType::DataLoaded, payload(), "t1");
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
    }

    #[test]
    fn snapshot_returns_only_events_after_given_id() {
        let mut buf = EventBuffer::new("abc");
        buf.push(EventType::Started, payload(), "t0");
        buf.push(EventType::DataLoaded, payload(), "t1");
        buf.push(EventType::FeaturesReady, payload(), "t2");
        let (events, etag) = buf.snapshot(1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 2);
        assert_eq!(events[1].id, 3);
        assert_eq!(etag, "abc:3");
    }

    #[test]
    fn etag_matches_reflects_last_id() {
        let mut buf = EventBuffer::new("abc");
        buf.push(EventType::Started, payload(), "t0");
        assert!(buf.etag_matches("abc:1"));
        assert!(!buf.etag_matches("abc:2"));
    }

    #[test]
    fn retains_at_least_256_events() {
        let mut buf = EventBuffer::new("abc");
        for i in 0..500 {
            buf.push(EventType::Heartbeat, payload(), format!("t{i}"));
        }
        assert!(buf.events.len() >= MIN_RETAINED);
    }

    #[test]
    fn backlog_since_is_gap_free_ascending() {
        let mut buf = EventBuffer::new("abc");
        for _ in 0..5 {
            buf.push(EventType::Heartbeat, payload(), "t");
        }
        let backlog = buf.backlog_since(2);
        let ids: Vec<u64> = backlog.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn subscriber_receives_events_pushed_after_subscribing() {
        let mut buf = EventBuffer::new("abc");
        let mut rx = buf.subscribe();
        buf.push(EventType::Started, payload(), "t0");
        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, 1);
        assert_eq!(received.event_type, EventType::Started);
    }
}
