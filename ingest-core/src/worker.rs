//! Extraction worker pool.
//!
//! Each worker owns its broker session through a [`ConnectionManager`],
//! consumes the feed queue with manual acks, dispatches every URL to the
//! registered extractor, persists the result and publishes a clean event.
//! Every delivery is acknowledged once handled, whatever the outcome:
//! unroutable URLs and failed extractions are dropped, not requeued.
//!
//! Workers run under a supervisor that restarts interrupted workers with a
//! bounded budget and never restarts one that failed to start.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionManager, Topology};
use crate::error::{IngestError, Result};
use crate::extract::ExtractorRegistry;
use crate::queue::{Broker, BrokerSession, CleanEvent, Delivery, OutboundMessage};
use crate::store::{ArticleStore, ContentUpdate, Mark, Priority};

#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub topology: Topology,
    pub registry: Arc<ExtractorRegistry>,
    pub store: Arc<dyn ArticleStore>,
    pub feed_queue: String,
    pub clean_queue: String,
    pub clean_publish_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Updated,
    /// No metadata row exists for the URL; nothing was written.
    Missing,
    Failed,
}

/// What happened to one delivery. The delivery is acknowledged in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Extracted {
        mark: Mark,
        priority: Priority,
        store: StoreOutcome,
        published: bool,
    },
    Unsupported,
    ExtractFailed,
    InvalidPayload,
}

/// Handle one feed-queue payload: dispatch, extract, persist, publish.
pub async fn process_delivery(
    ctx: &WorkerContext,
    conn: &mut ConnectionManager,
    body: &[u8],
) -> Outcome {
    let url = match std::str::from_utf8(body) {
        Ok(url) if !url.trim().is_empty() => url.trim(),
        _ => {
            warn!(bytes = body.len(), "dropping message without a utf-8 url");
            return Outcome::InvalidPayload;
        }
    };

    let Some(extractor) = ctx.registry.resolve(url) else {
        warn!(url = %url, error = %IngestError::UnsupportedSource(url.to_owned()), "dropping message");
        return Outcome::Unsupported;
    };

    let text = match extractor.extract(url).await {
        Ok(text) => text,
        Err(err) => {
            warn!(url = %url, extractor = extractor.name(), error = %err, "extraction failed");
            return Outcome::ExtractFailed;
        }
    };

    let update = ContentUpdate::from_text(&text);
    let store = match ctx.store.update_content(url, &update).await {
        Ok(true) => StoreOutcome::Updated,
        Ok(false) => {
            warn!(url = %url, "no metadata row for extracted article; content not stored");
            StoreOutcome::Missing
        }
        Err(err) => {
            warn!(url = %url, error = %err, "failed to store article content");
            StoreOutcome::Failed
        }
    };

    let published = publish_clean(ctx, conn, &CleanEvent::new(url, text.trim())).await;

    Outcome::Extracted {
        mark: update.mark,
        priority: update.priority,
        store,
        published,
    }
}

async fn publish_clean(ctx: &WorkerContext, conn: &mut ConnectionManager, event: &CleanEvent) -> bool {
    let message = match OutboundMessage::json(event) {
        Ok(message) => message,
        Err(err) => {
            error!(url = %event.url, error = %err, "failed to encode clean event");
            return false;
        }
    };

    let attempts = ctx.clean_publish_retries.saturating_add(1);
    for attempt in 1..=attempts {
        match conn.publish(&ctx.clean_queue, &message).await {
            Ok(()) => return true,
            Err(err) if attempt < attempts => {
                warn!(url = %event.url, attempt, error = %err, "clean event publish failed, retrying");
            }
            Err(err) => {
                error!(url = %event.url, attempts, error = %err, "clean event not published");
            }
        }
    }
    false
}

#[derive(Debug)]
pub enum WorkerExit {
    /// Stop signal received.
    Stopped,
    /// The consume loop broke off. `consumed` is set when this run got as far
    /// as consuming, so only runs that never reached the broker count as
    /// failed restarts.
    Interrupted { error: IngestError, consumed: bool },
    /// The worker could not obtain a session when first started.
    Fatal(IngestError),
}

pub struct Worker {
    id: usize,
    ctx: WorkerContext,
    conn: ConnectionManager,
    started: bool,
    processed: u64,
}

impl Worker {
    pub fn new(id: usize, ctx: WorkerContext) -> Self {
        let conn = ConnectionManager::new(Arc::clone(&ctx.broker), ctx.topology.clone());
        Self::with_connection(id, ctx, conn)
    }

    /// Start from a session opened elsewhere; it is checked before consuming.
    pub fn with_session(id: usize, ctx: WorkerContext, session: Box<dyn BrokerSession>) -> Self {
        let conn = ConnectionManager::with_session(
            Arc::clone(&ctx.broker),
            ctx.topology.clone(),
            session,
        );
        Self::with_connection(id, ctx, conn)
    }

    fn with_connection(id: usize, ctx: WorkerContext, conn: ConnectionManager) -> Self {
        Self {
            id,
            ctx,
            conn,
            started: false,
            processed: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn reconnects(&self) -> u32 {
        self.conn.reconnects()
    }

    /// Consume until stopped or the session is lost.
    ///
    /// A lost session is replaced at once and consumption resumes; the run
    /// only ends with `Interrupted` when the replacement fails or a fresh
    /// session closes before delivering anything.
    pub async fn run(&mut self, stop: &mut watch::Receiver<bool>) -> WorkerExit {
        if *stop.borrow() {
            return WorkerExit::Stopped;
        }

        let mut consumed = false;
        let tag = format!("worker-{}", self.id);
        loop {
            let opened = match self.conn.ensure_open().await {
                Ok(session) => session.consume(&self.ctx.feed_queue, &tag).await,
                Err(err) => Err(err),
            };
            let mut deliveries = match opened {
                Ok(deliveries) => deliveries,
                Err(err) if !self.started => return WorkerExit::Fatal(err),
                Err(err) => return WorkerExit::Interrupted { error: err, consumed },
            };
            consumed = true;
            if !self.started {
                self.started = true;
                info!(worker = self.id, queue = %self.ctx.feed_queue, "worker consuming");
            }

            let mut handled_this_session = 0u64;
            let reason = loop {
                tokio::select! {
                    _ = stop.changed() => {
                        info!(worker = self.id, processed = self.processed, "worker stopping");
                        self.conn.close().await;
                        return WorkerExit::Stopped;
                    }
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            self.handle(delivery).await;
                            handled_this_session += 1;
                        }
                        Some(Err(err)) => break err,
                        None => break IngestError::connection_lost("delivery stream ended"),
                    }
                }
            };

            if handled_this_session == 0 {
                return WorkerExit::Interrupted {
                    error: reason,
                    consumed,
                };
            }
            warn!(worker = self.id, error = %reason, "consume loop interrupted; reconnecting");
        }
    }

    async fn handle(&mut self, delivery: Delivery) {
        let url = String::from_utf8_lossy(&delivery.body).into_owned();
        debug!(worker = self.id, url = %url, redelivered = delivery.redelivered, "received message");

        let outcome = process_delivery(&self.ctx, &mut self.conn, &delivery.body).await;
        self.processed += 1;
        match &outcome {
            Outcome::Extracted { mark, priority, store, published } => info!(
                worker = self.id,
                url = %url,
                mark = %mark,
                priority = priority.value(),
                store = ?store,
                published,
                "processed article"
            ),
            other => debug!(worker = self.id, url = %url, outcome = ?other, "message dropped"),
        }

        if let Err(err) = delivery.ack().await {
            warn!(worker = self.id, url = %url, error = %err, "failed to acknowledge message");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Fatal(String),
    /// Restart budget exhausted.
    GaveUp(String),
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub id: usize,
    pub state: WorkerState,
    pub restarts: u32,
    pub reconnects: u32,
    pub processed: u64,
}

async fn supervise(
    mut worker: Worker,
    policy: RestartPolicy,
    mut stop: watch::Receiver<bool>,
) -> WorkerReport {
    let mut restarts = 0u32;
    let mut consecutive = 0u32;

    let state = loop {
        match worker.run(&mut stop).await {
            WorkerExit::Stopped => break WorkerState::Stopped,
            WorkerExit::Fatal(err) => {
                error!(worker = worker.id(), error = %err, "worker failed to start");
                break WorkerState::Fatal(err.to_string());
            }
            WorkerExit::Interrupted { error: err, consumed } => {
                if consumed {
                    consecutive = 0;
                }
                consecutive += 1;
                if consecutive > policy.max_restarts {
                    error!(worker = worker.id(), error = %err, restarts, "worker restart budget exhausted");
                    break WorkerState::GaveUp(err.to_string());
                }
                restarts += 1;
                let delay = policy.backoff * consecutive;
                warn!(worker = worker.id(), error = %err, attempt = consecutive, delay = ?delay, "restarting worker");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => break WorkerState::Stopped,
                }
            }
        }
    };

    WorkerReport {
        id: worker.id(),
        state,
        restarts,
        reconnects: worker.reconnects(),
        processed: worker.processed(),
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Start `size` supervised workers, each with its own session.
    pub fn spawn(ctx: WorkerContext, size: usize, policy: RestartPolicy) -> PoolHandle {
        let workers = (0..size).map(|id| Worker::new(id, ctx.clone())).collect();
        Self::spawn_workers(workers, policy)
    }

    pub fn spawn_workers(workers: Vec<Worker>, policy: RestartPolicy) -> PoolHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = workers
            .into_iter()
            .map(|worker| tokio::spawn(supervise(worker, policy, stop_rx.clone())))
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "worker pool started");
        PoolHandle { stop_tx, handles }
    }
}

pub struct PoolHandle {
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<WorkerReport>>,
}

impl PoolHandle {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// True once every worker has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }

    /// Signal every worker and wait for them to finish their current message.
    pub async fn stop(self) -> Result<Vec<WorkerReport>> {
        let _ = self.stop_tx.send(true);
        self.join().await
    }

    /// Wait for every worker without signalling them.
    pub async fn join(self) -> Result<Vec<WorkerReport>> {
        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            reports.push(handle.await?);
        }
        Ok(reports)
    }
}
