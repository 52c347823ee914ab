//! Append-only message log with multi-subscriber fan-out.
//!
//! The log owns the subscriber list; subscribers hold only a channel and
//! deregister on drop. Appends assign contiguous indexes and notify every
//! subscriber without blocking: channels are unbounded, so a slow
//! consumer can never stall the appender or lose intermediate messages.

use std::sync::{Arc, Mutex};

use mend_core::{AgentMessage, AgentState, StateTransition};
use tokio::sync::mpsc;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

struct LogInner<T> {
    entries: Vec<T>,
    subscribers: Vec<Subscriber<T>>,
    next_subscriber_id: u64,
}

impl<T> Default for LogInner<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            subscribers: Vec::new(),
            next_subscriber_id: 0,
        }
    }
}

/// The append-only log of agent messages.
#[derive(Default)]
pub struct MessageLog {
    inner: Mutex<LogInner<AgentMessage>>,
}

impl MessageLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a message, assigning the next index. Returns the stored
    /// message. Never blocks on subscribers.
    pub fn append(&self, mut msg: AgentMessage) -> AgentMessage {
        let (msg, senders) = {
            let mut inner = self.inner.lock().unwrap();
            msg.idx = inner.entries.len();
            inner.entries.push(msg.clone());
            let senders: Vec<mpsc::UnboundedSender<AgentMessage>> =
                inner.subscribers.iter().map(|s| s.tx.clone()).collect();
            (msg, senders)
        };
        // Channel sends happen outside the lock.
        for tx in senders {
            let _ = tx.send(msg.clone());
        }
        msg
    }

    /// Synchronous half-open range read, clamped to the stored range.
    pub fn messages(&self, start: usize, end: usize) -> Vec<AgentMessage> {
        let inner = self.inner.lock().unwrap();
        let len = inner.entries.len();
        let start = start.min(len);
        let end = end.min(len);
        if start >= end {
            return Vec::new();
        }
        inner.entries[start..end].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe starting at `start_idx`: already-stored messages from
    /// there are replayed first, then new arrivals, in strictly ascending
    /// contiguous index order.
    pub fn iter(self: &Arc<Self>, start_idx: usize) -> MessageIterator {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            // Replay and registration happen under one lock so no append
            // can interleave between them.
            for msg in inner.entries.iter().skip(start_idx) {
                let _ = tx.send(msg.clone());
            }
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(Subscriber { id, tx });
            id
        };
        MessageIterator {
            id,
            rx,
            log: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| s.id != id);
    }
}

/// Blocking iterator over the message log for one subscriber.
pub struct MessageIterator {
    id: u64,
    rx: mpsc::UnboundedReceiver<AgentMessage>,
    log: Arc<MessageLog>,
}

impl MessageIterator {
    /// Next message; None only after the iterator is closed.
    pub async fn next(&mut self) -> Option<AgentMessage> {
        self.rx.recv().await
    }

    /// Non-blocking variant for drain loops.
    pub fn try_next(&mut self) -> Option<AgentMessage> {
        self.rx.try_recv().ok()
    }

    /// Deregister the subscriber. Dropping has the same effect.
    pub fn close(self) {}
}

impl Drop for MessageIterator {
    fn drop(&mut self) {
        self.log.unsubscribe(self.id);
    }
}

/// Parallel structure recording agent state transitions.
#[derive(Default)]
pub struct StateLog {
    inner: Mutex<LogInner<StateTransition>>,
    current: Mutex<AgentState>,
}

impl StateLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> AgentState {
        *self.current.lock().unwrap()
    }

    /// Record a transition to `to` and notify subscribers. The stored
    /// current state is always consistent with the last transition sent.
    pub fn transition(&self, to: AgentState, event: impl Into<String>) -> StateTransition {
        let (transition, senders) = {
            let mut current = self.current.lock().unwrap();
            let transition = StateTransition::new(*current, to, event);
            *current = to;
            let mut inner = self.inner.lock().unwrap();
            inner.entries.push(transition.clone());
            let senders: Vec<mpsc::UnboundedSender<StateTransition>> =
                inner.subscribers.iter().map(|s| s.tx.clone()).collect();
            (transition, senders)
        };
        for tx in senders {
            let _ = tx.send(transition.clone());
        }
        transition
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.inner.lock().unwrap().entries.clone()
    }

    pub fn iter(self: &Arc<Self>) -> StateIterator {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.push(Subscriber { id, tx });
            id
        };
        StateIterator {
            id,
            rx,
            log: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| s.id != id);
    }
}

pub struct StateIterator {
    id: u64,
    rx: mpsc::UnboundedReceiver<StateTransition>,
    log: Arc<StateLog>,
}

impl StateIterator {
    pub async fn next(&mut self) -> Option<StateTransition> {
        self.rx.recv().await
    }
}

impl Drop for StateIterator {
    fn drop(&mut self) {
        self.log.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_core::MessageKind;

    fn msg(content: &str) -> AgentMessage {
        AgentMessage::new(MessageKind::System, content)
    }

    #[test]
    fn append_assigns_contiguous_indexes() {
        let log = MessageLog::new();
        for i in 0..5 {
            let stored = log.append(msg(&format!("m{i}")));
            assert_eq!(stored.idx, i);
        }
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn range_read_round_trip() {
        let log = MessageLog::new();
        let stored = log.append(msg("only"));
        let got = log.messages(stored.idx, stored.idx + 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].idx, stored.idx);
        assert_eq!(got[0].content, "only");
    }

    #[test]
    fn range_read_clamps() {
        let log = MessageLog::new();
        log.append(msg("a"));
        log.append(msg("b"));
        assert_eq!(log.messages(0, 100).len(), 2);
        assert!(log.messages(5, 10).is_empty());
        assert!(log.messages(1, 1).is_empty());
    }

    #[tokio::test]
    async fn iterator_replays_backlog_then_streams() {
        let log = MessageLog::new();
        log.append(msg("a"));
        log.append(msg("b"));

        let mut it = log.iter(0);
        assert_eq!(it.next().await.unwrap().content, "a");
        assert_eq!(it.next().await.unwrap().content, "b");

        log.append(msg("c"));
        assert_eq!(it.next().await.unwrap().content, "c");
    }

    #[tokio::test]
    async fn iterator_from_offset() {
        let log = MessageLog::new();
        log.append(msg("a"));
        log.append(msg("b"));
        let mut it = log.iter(1);
        assert_eq!(it.next().await.unwrap().content, "b");
    }

    #[tokio::test]
    async fn indexes_ascend_without_gaps_per_subscriber() {
        let log = MessageLog::new();
        let mut it = log.iter(0);
        let appender = {
            let log = log.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    log.append(msg(&format!("m{i}")));
                    if i % 17 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        let mut prev: Option<usize> = None;
        for _ in 0..200 {
            let m = it.next().await.unwrap();
            if let Some(p) = prev {
                assert_eq!(m.idx, p + 1, "gap after {p}");
            } else {
                assert_eq!(m.idx, 0);
            }
            prev = Some(m.idx);
        }
        appender.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_iterator_deregisters() {
        let log = MessageLog::new();
        {
            let _it = log.iter(0);
            assert_eq!(log.inner.lock().unwrap().subscribers.len(), 1);
        }
        assert_eq!(log.inner.lock().unwrap().subscribers.len(), 0);
        // Appending after the drop must not panic or block.
        log.append(msg("a"));
    }

    #[tokio::test]
    async fn state_log_tracks_current() {
        let log = StateLog::new();
        assert_eq!(log.current(), AgentState::Idle);
        let mut it = log.iter();
        log.transition(AgentState::SendingToLlm, "user message");
        log.transition(AgentState::EndOfTurn, "no tool uses");
        let t1 = it.next().await.unwrap();
        assert_eq!(t1.from, AgentState::Idle);
        assert_eq!(t1.to, AgentState::SendingToLlm);
        let t2 = it.next().await.unwrap();
        assert_eq!(t2.to, AgentState::EndOfTurn);
        assert_eq!(log.current(), AgentState::EndOfTurn);
        assert_eq!(log.transitions().len(), 2);
    }
}
