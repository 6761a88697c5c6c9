//! Per tool-call log fan-out.
//!
//! Every tool call has a bounded history of `LogLine`s and zero or more live
//! subscribers. Delivery never blocks the producer: a subscriber whose
//! buffer is full misses the line. The number of distinct tool calls kept is
//! capped; once exceeded, the oldest keys without a live subscriber are
//! evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use opsgate_contracts::log::LogLine;

pub const DEFAULT_HISTORY_LINES: usize = 500;
pub const DEFAULT_MAX_KEYS: usize = 1000;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct KeyState {
    lines: VecDeque<LogLine>,
    subscribers: Vec<(u64, SyncSender<LogLine>)>,
}

#[derive(Default)]
struct HubState {
    keys: HashMap<String, KeyState>,
    /// Keys oldest first.
    order: VecDeque<String>,
    next_subscriber: u64,
}

impl HubState {
    fn key_mut(&mut self, key: &str) -> &mut KeyState {
        if !self.keys.contains_key(key) {
            self.order.push_back(key.to_string());
        }
        self.keys.entry(key.to_string()).or_default()
    }

    fn evict(&mut self, max_keys: usize) {
        if self.keys.len() <= max_keys {
            return;
        }
        let mut excess = self.keys.len() - max_keys;
        let keys = &mut self.keys;
        self.order.retain(|key| {
            if excess == 0 {
                return true;
            }
            let idle = keys.get(key).map_or(true, |k| k.subscribers.is_empty());
            if idle {
                keys.remove(key);
                excess -= 1;
                debug!(tool_call_id = %key, "evicted log history");
            }
            !idle
        });
    }
}

struct Inner {
    history_lines: usize,
    max_keys: usize,
    subscriber_buffer: usize,
    state: Mutex<HubState>,
}

impl Inner {
    /// A panic while holding the lock cannot leave the maps inconsistent
    /// enough to matter for logs, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let mut state = self.lock();
        if let Some(k) = state.keys.get_mut(key) {
            k.subscribers.retain(|(sid, _)| *sid != id);
        }
        let max_keys = self.max_keys;
        state.evict(max_keys);
    }
}

/// Shared handle; clones refer to the same hub.
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<Inner>,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LINES, DEFAULT_MAX_KEYS, DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl LogHub {
    /// Zero values are raised to one.
    pub fn new(history_lines: usize, max_keys: usize, subscriber_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                history_lines: history_lines.max(1),
                max_keys: max_keys.max(1),
                subscriber_buffer: subscriber_buffer.max(1),
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Append `line` to its tool call's history and offer it to every live
    /// subscriber.
    pub fn publish(&self, line: LogLine) {
        let inner = &self.inner;
        let mut state = inner.lock();
        let key = state.key_mut(&line.tool_call_id);

        key.subscribers.retain(|(_, tx)| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(tool_call_id = %line.tool_call_id, "subscriber buffer full, line dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        key.lines.push_back(line);
        while key.lines.len() > inner.history_lines {
            key.lines.pop_front();
        }
        state.evict(inner.max_keys);
    }

    /// Receive lines published for `tool_call_id` from now on.
    pub fn subscribe(&self, tool_call_id: &str) -> Subscription {
        let (tx, rx) = mpsc::sync_channel(self.inner.subscriber_buffer);
        let mut state = self.inner.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.key_mut(tool_call_id).subscribers.push((id, tx));
        state.evict(self.inner.max_keys);
        Subscription {
            hub: self.inner.clone(),
            key: tool_call_id.to_string(),
            id,
            receiver: rx,
        }
    }

    /// A copy of the retained lines, oldest first.
    pub fn history(&self, tool_call_id: &str) -> Vec<LogLine> {
        self.inner
            .lock()
            .keys
            .get(tool_call_id)
            .map(|k| k.lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Disconnect every subscriber of `tool_call_id`. History is kept.
    pub fn close(&self, tool_call_id: &str) {
        if let Some(k) = self.inner.lock().keys.get_mut(tool_call_id) {
            k.subscribers.clear();
        }
    }

    /// Disconnect every subscriber of every key.
    pub fn close_all(&self) {
        for key in self.inner.lock().keys.values_mut() {
            key.subscribers.clear();
        }
    }

    /// Number of tool calls with retained state.
    pub fn key_count(&self) -> usize {
        self.inner.lock().keys.len()
    }
}

/// Live feed for one tool call. Dropping it unsubscribes.
pub struct Subscription {
    hub: Arc<Inner>,
    key: String,
    id: u64,
    receiver: Receiver<LogLine>,
}

impl Subscription {
    pub fn tool_call_id(&self) -> &str {
        &self.key
    }

    /// Whether the hub still delivers to this feed. Buffered lines stay
    /// readable after it is closed.
    pub fn is_open(&self) -> bool {
        self.hub
            .lock()
            .keys
            .get(&self.key)
            .is_some_and(|k| k.subscribers.iter().any(|(id, _)| *id == self.id))
    }

    /// Next line without waiting.
    pub fn try_recv(&self) -> Option<LogLine> {
        self.receiver.try_recv().ok()
    }

    /// Next line, waiting up to `timeout`. `None` on timeout or once the
    /// hub closed this feed and the buffer is drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<LogLine> {
        match self.receiver.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;
    use opsgate_contracts::log::LogLevel;

    use super::*;

    fn line(key: &str, message: &str) -> LogLine {
        LogLine {
            tool_call_id: key.to_string(),
            execution_id: None,
            tool: "kubectl".to_string(),
            action: "get".to_string(),
            level: LogLevel::Info,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn messages(lines: &[LogLine]) -> Vec<&str> {
        lines.iter().map(|l| l.message.as_str()).collect()
    }

    // ── History ──────────────────────────────────────────────────────────────

    #[test]
    fn history_is_capped_oldest_first() {
        let hub = LogHub::new(3, 10, 4);
        for m in ["1", "2", "3", "4", "5"] {
            hub.publish(line("tc", m));
        }
        assert_eq!(messages(&hub.history("tc")), vec!["3", "4", "5"]);
    }

    #[test]
    fn history_is_a_copy() {
        let hub = LogHub::default();
        hub.publish(line("tc", "a"));
        let mut copy = hub.history("tc");
        copy.clear();
        assert_eq!(hub.history("tc").len(), 1);
        assert!(hub.history("unknown").is_empty());
    }

    // ── Fan-out ──────────────────────────────────────────────────────────────

    #[test]
    fn subscribers_receive_live_lines() {
        let hub = LogHub::default();
        let first = hub.subscribe("tc");
        let second = hub.subscribe("tc");
        let other = hub.subscribe("other");

        hub.publish(line("tc", "start"));

        assert_eq!(first.try_recv().unwrap().message, "start");
        assert_eq!(second.try_recv().unwrap().message, "start");
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn full_subscriber_drops_newest_without_blocking() {
        let hub = LogHub::new(100, 10, 2);
        let sub = hub.subscribe("tc");

        let started = Instant::now();
        for m in ["a", "b", "c", "d"] {
            hub.publish(line("tc", m));
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(sub.try_recv().unwrap().message, "a");
        assert_eq!(sub.try_recv().unwrap().message, "b");
        assert!(sub.try_recv().is_none());
        assert_eq!(hub.history("tc").len(), 4);
    }

    #[test]
    fn close_disconnects_but_keeps_history() {
        let hub = LogHub::default();
        let sub = hub.subscribe("tc");
        hub.publish(line("tc", "a"));
        assert!(sub.is_open());
        hub.close("tc");
        assert!(!sub.is_open());

        assert_eq!(sub.recv_timeout(Duration::from_millis(10)).unwrap().message, "a");
        assert!(sub.recv_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(hub.history("tc").len(), 1);
    }

    // ── Eviction ─────────────────────────────────────────────────────────────

    #[test]
    fn oldest_idle_keys_are_evicted() {
        let hub = LogHub::new(10, 2, 4);
        hub.publish(line("k1", "a"));
        hub.publish(line("k2", "a"));
        hub.publish(line("k3", "a"));

        assert_eq!(hub.key_count(), 2);
        assert!(hub.history("k1").is_empty());
        assert_eq!(hub.history("k3").len(), 1);
    }

    #[test]
    fn subscribed_keys_are_never_evicted() {
        let hub = LogHub::new(10, 2, 4);
        hub.publish(line("k1", "a"));
        let _sub = hub.subscribe("k1");
        hub.publish(line("k2", "a"));
        hub.publish(line("k3", "a"));

        assert_eq!(hub.history("k1").len(), 1);
        assert!(hub.history("k2").is_empty());
    }

    #[test]
    fn dropping_subscription_makes_key_evictable() {
        let hub = LogHub::new(10, 2, 4);
        let sub = hub.subscribe("k1");
        hub.publish(line("k1", "a"));
        hub.publish(line("k2", "a"));
        hub.publish(line("k3", "a"));
        assert_eq!(hub.history("k1").len(), 1);
        assert!(hub.history("k2").is_empty());

        drop(sub);
        hub.publish(line("k4", "a"));
        assert!(hub.history("k1").is_empty());
        assert_eq!(hub.history("k3").len(), 1);
        assert_eq!(hub.key_count(), 2);
    }
}
