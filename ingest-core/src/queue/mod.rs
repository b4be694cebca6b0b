//! Work queue abstraction over a durable broker.
//!
//! A [`BrokerSession`] is one connection plus one channel. Sessions are never
//! shared between tasks: the poller owns one for publishing and every worker
//! opens its own for consuming, so prefetch limits apply per session.
//!
//! Delivery is at-least-once. A message that was handed to a consumer but not
//! acknowledged goes back to the queue when that consumer's session closes.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Event published once an article's text is ready for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanEvent {
    pub url: String,
    pub content: String,
}

impl CleanEvent {
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content: content.into(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A persistent message ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

impl OutboundMessage {
    /// Raw canonical URL for the feed queue.
    pub fn text(body: &str) -> Self {
        Self {
            body: body.as_bytes().to_vec(),
            content_type: CONTENT_TYPE_TEXT,
        }
    }

    pub fn json(event: &CleanEvent) -> Result<Self> {
        Ok(Self {
            body: event.to_payload()?,
            content_type: CONTENT_TYPE_JSON,
        })
    }
}

/// Opens independent sessions against the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrokerSession>>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Declare a durable queue; idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Limit unacknowledged deliveries in flight on this session.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Resolves once the broker accepted the message, not once it was consumed.
    async fn publish(&self, queue: &str, message: &OutboundMessage) -> Result<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Box<dyn Deliveries>>;

    async fn close(&self) -> Result<()>;
}

/// Stream of deliveries; `None` means the underlying channel is gone.
#[async_trait]
pub trait Deliveries: Send {
    async fn next(&mut self) -> Option<Result<Delivery>>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

pub struct Delivery {
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
