//! Keeps one live broker session for its owner, replacing it when closed.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::queue::{Broker, BrokerSession, OutboundMessage};

/// Queues and QoS applied to every session the manager opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub queues: Vec<String>,
    pub prefetch: u16,
}

impl Topology {
    pub fn new(queues: impl IntoIterator<Item = impl Into<String>>, prefetch: u16) -> Self {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            prefetch,
        }
    }

    async fn apply(&self, session: &dyn BrokerSession) -> Result<()> {
        for queue in &self.queues {
            session.declare_queue(queue).await?;
        }
        if self.prefetch > 0 {
            session.set_prefetch(self.prefetch).await?;
        }
        Ok(())
    }
}

pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    topology: Topology,
    session: Option<Box<dyn BrokerSession>>,
    reconnects: u32,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self {
            broker,
            topology,
            session: None,
            reconnects: 0,
        }
    }

    /// Start from an already opened session; it is only replaced once closed.
    pub fn with_session(
        broker: Arc<dyn Broker>,
        topology: Topology,
        session: Box<dyn BrokerSession>,
    ) -> Self {
        Self {
            broker,
            topology,
            session: Some(session),
            reconnects: 0,
        }
    }

    /// Sessions opened to replace a closed one.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Return the current session, opening a fresh one (a single attempt)
    /// if there is none or it has been closed.
    pub async fn ensure_open(&mut self) -> Result<&dyn BrokerSession> {
        let session = match self.session.take() {
            Some(session) if !session.is_closed() => session,
            previous => self.open_fresh(previous.is_some()).await?,
        };
        Ok(&**self.session.insert(session))
    }

    /// Close the current session, if any, and open a new one.
    pub async fn reconnect(&mut self) -> Result<&dyn BrokerSession> {
        let replacing = match self.session.take() {
            Some(old) => {
                if let Err(err) = old.close().await {
                    warn!(error = %err, "failed to close stale broker session");
                }
                true
            }
            None => false,
        };
        let session = self.open_fresh(replacing).await?;
        Ok(&**self.session.insert(session))
    }

    async fn open_fresh(&mut self, replacing: bool) -> Result<Box<dyn BrokerSession>> {
        let session = self.broker.open().await?;
        self.topology.apply(session.as_ref()).await?;
        if replacing {
            self.reconnects += 1;
            info!(reconnects = self.reconnects, "re-established broker session");
        }
        Ok(session)
    }

    pub async fn publish(&mut self, queue: &str, message: &OutboundMessage) -> Result<()> {
        let session = self.ensure_open().await?;
        session.publish(queue, message).await
    }

    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = session.close().await {
                warn!(error = %err, "failed to close broker session");
            }
        }
    }
}
