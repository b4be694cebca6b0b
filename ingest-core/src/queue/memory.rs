//! In-process broker with the delivery semantics the pipeline relies on:
//! manual acks, per-session prefetch, and redelivery of unacknowledged
//! messages when the session that held them closes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Acknowledger, Broker, BrokerSession, Deliveries, Delivery, OutboundMessage};
use crate::error::{IngestError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Inflight {
    session: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    published: HashMap<String, Vec<OutboundMessage>>,
    inflight: HashMap<u64, Inflight>,
    prefetch: HashMap<u64, u16>,
    open_sessions: HashSet<u64>,
    next_session: u64,
    next_tag: u64,
    sessions_opened: usize,
    acked: usize,
    failing_opens: usize,
    failing_publishes: usize,
}

impl State {
    fn close_session(&mut self, session: u64) -> bool {
        if !self.open_sessions.remove(&session) {
            return false;
        }
        self.prefetch.remove(&session);

        let mut tags: Vec<u64> = self
            .inflight
            .iter()
            .filter(|(_, i)| i.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        // Push back newest first so the oldest ends up at the front.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(inflight) = self.inflight.remove(&tag) {
                let mut message = inflight.message;
                message.redelivered = true;
                self.queues
                    .entry(inflight.queue)
                    .or_default()
                    .push_front(message);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Test double. The published log keeps every message for inspection and is
/// never trimmed, so it is not meant for long-running processes.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting to be delivered on `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Every message ever published to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<OutboundMessage> {
        self.shared
            .lock()
            .published
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().inflight.len()
    }

    pub fn acked(&self) -> usize {
        self.shared.lock().acked
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.lock().sessions_opened
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.lock().open_sessions.len()
    }

    /// Close every open session as if the broker dropped the connections.
    pub fn close_sessions(&self) {
        let mut state = self.shared.lock();
        let sessions: Vec<u64> = state.open_sessions.iter().copied().collect();
        for session in sessions {
            state.close_session(session);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.lock().failing_opens = count;
    }

    /// Make the next `count` publishes fail on any session.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.lock().failing_publishes = count;
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open(&self) -> Result<Box<dyn BrokerSession>> {
        let mut state = self.shared.lock();
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(IngestError::connection_lost("broker refused connection"));
        }
        state.next_session += 1;
        let id = state.next_session;
        state.open_sessions.insert(id);
        state.sessions_opened += 1;
        Ok(Box::new(MemorySession {
            id,
            shared: self.shared.clone(),
        }))
    }
}

pub struct MemorySession {
    id: u64,
    shared: Arc<Shared>,
}

impl MemorySession {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if state.open_sessions.contains(&self.id) {
            Ok(())
        } else {
            Err(IngestError::connection_lost("session closed"))
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn is_closed(&self) -> bool {
        !self.shared.lock().open_sessions.contains(&self.id)
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        state.queues.entry(queue.to_owned()).or_default();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        state.prefetch.insert(self.id, count);
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<()> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(IngestError::connection_lost("publish rejected"));
            }
            state
                .published
                .entry(queue.to_owned())
                .or_default()
                .push(message.clone());
            state
                .queues
                .entry(queue.to_owned())
                .or_default()
                .push_back(StoredMessage {
                    body: message.body.clone(),
                    redelivered: false,
                });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<Box<dyn Deliveries>> {
        let state = self.shared.lock();
        self.ensure_open(&state)?;
        Ok(Box::new(MemoryDeliveries {
            session: self.id,
            queue: queue.to_owned(),
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let closed = self.shared.lock().close_session(self.id);
        if closed {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        let closed = self.shared.lock().close_session(self.id);
        if closed {
            self.shared.notify.notify_waiters();
        }
    }
}

struct MemoryDeliveries {
    session: u64,
    queue: String,
    shared: Arc<Shared>,
}

impl MemoryDeliveries {
    // None: session closed. Some(None): nothing deliverable right now.
    fn try_take(&self) -> Option<Option<Delivery>> {
        let mut state = self.shared.lock();
        if !state.open_sessions.contains(&self.session) {
            return None;
        }
        let limit = state.prefetch.get(&self.session).copied().unwrap_or(0);
        let held = state
            .inflight
            .values()
            .filter(|i| i.session == self.session)
            .count();
        if limit > 0 && held >= usize::from(limit) {
            return Some(None);
        }
        let Some(message) = state.queues.get_mut(&self.queue).and_then(VecDeque::pop_front) else {
            return Some(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery::new(
            message.body.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                tag,
                shared: self.shared.clone(),
            }),
        );
        state.inflight.insert(
            tag,
            Inflight {
                session: self.session,
                queue: self.queue.clone(),
                message,
            },
        );
        Some(Some(delivery))
    }
}

#[async_trait]
impl Deliveries for MemoryDeliveries {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        loop {
            let notified = self.shared.notify.notified();
            match self.try_take() {
                None => return None,
                Some(Some(delivery)) => return Some(Ok(delivery)),
                Some(None) => notified.await,
            }
        }
    }
}

struct MemoryAcker {
    tag: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            if state.inflight.remove(&self.tag).is_none() {
                return Err(IngestError::connection_lost(
                    "delivery is no longer held by this session",
                ));
            }
            state.acked += 1;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn session(broker: &MemoryBroker, queue: &str) -> Box<dyn BrokerSession> {
        let session = broker.open().await.unwrap();
        session.declare_queue(queue).await.unwrap();
        session
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_after_close() {
        let broker = MemoryBroker::new();
        let producer = session(&broker, "q").await;
        producer
            .publish("q", &OutboundMessage::text("https://x/a"))
            .await
            .unwrap();

        let consumer = session(&broker, "q").await;
        let mut deliveries = consumer.consume("q", "c1").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.in_flight(), 1);

        consumer.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.ready_count("q"), 1);

        let other = session(&broker, "q").await;
        let mut deliveries = other.consume("q", "c2").await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, b"https://x/a");
        again.ack().await.unwrap();
        assert_eq!(broker.acked(), 1);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let producer = session(&broker, "q").await;
        for i in 0..3 {
            producer
                .publish("q", &OutboundMessage::text(&format!("https://x/{i}")))
                .await
                .unwrap();
        }

        let consumer = session(&broker, "q").await;
        consumer.set_prefetch(1).await.unwrap();
        let mut deliveries = consumer.consume("q", "c").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"https://x/1");
    }

    #[tokio::test]
    async fn closed_session_rejects_publish() {
        let broker = MemoryBroker::new();
        let s = session(&broker, "q").await;
        broker.close_sessions();
        assert!(s.is_closed());
        let err = s
            .publish("q", &OutboundMessage::text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ConnectionLost(_)));
    }
}
