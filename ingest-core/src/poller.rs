use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::dedup::DedupGate;
use crate::error::IngestError;
use crate::feed::{fetch_feed, FeedItem};
use crate::queue::OutboundMessage;
use crate::store::{ArticleMetadata, ArticleStore};

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// Collaborators the poller writes to for every accepted item.
#[derive(Clone)]
pub struct PollContext {
    pub gate: DedupGate,
    pub store: Arc<dyn ArticleStore>,
    pub feed_queue: String,
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub sources: usize,
    pub failed_sources: usize,
    pub items: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub gate_failures: usize,
    pub store_failures: usize,
    pub enqueued: usize,
    pub enqueue_failures: usize,
}

impl PollStats {
    fn absorb(&mut self, other: PollStats) {
        self.sources += other.sources;
        self.failed_sources += other.failed_sources;
        self.items += other.items;
        self.accepted += other.accepted;
        self.duplicates += other.duplicates;
        self.gate_failures += other.gate_failures;
        self.store_failures += other.store_failures;
        self.enqueued += other.enqueued;
        self.enqueue_failures += other.enqueue_failures;
    }
}

pub struct PollerHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn stop(self) -> Result<(), IngestError> {
        let _ = self.cancel_tx.send(());
        self.join.await.map_err(IngestError::from)
    }
}

/// Run poll cycles until stopped. The first cycle starts immediately; a
/// cycle that overruns the interval delays the next one rather than
/// stacking ticks.
pub fn spawn_poller(
    feeds: Vec<String>,
    config: PollConfig,
    client: Client,
    ctx: PollContext,
    mut producer: ConnectionManager,
) -> PollerHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(sources = feeds.len(), interval = ?config.interval, "poller started");

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    info!("poller shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    let stats = poll_once(&feeds, &client, &ctx, &mut producer).await;
                    info!(
                        sources = stats.sources,
                        failed_sources = stats.failed_sources,
                        items = stats.items,
                        accepted = stats.accepted,
                        duplicates = stats.duplicates,
                        enqueued = stats.enqueued,
                        "poll cycle finished"
                    );
                }
            }
        }
        producer.close().await;
    });

    PollerHandle { cancel_tx, join }
}

/// Poll every source once, in order. A failing source is logged and skipped.
pub async fn poll_once(
    feeds: &[String],
    client: &Client,
    ctx: &PollContext,
    producer: &mut ConnectionManager,
) -> PollStats {
    let mut stats = PollStats::default();
    for feed_url in feeds {
        stats.sources += 1;
        match fetch_feed(client, feed_url).await {
            Ok(items) => {
                debug!(feed = %feed_url, items = items.len(), "fetched feed");
                stats.absorb(ingest_items(&items, ctx, producer).await);
            }
            Err(err) => {
                stats.failed_sources += 1;
                warn!(feed = %feed_url, error = %err, "failed to fetch feed");
            }
        }
    }
    stats
}

/// Gate, persist and enqueue each item. Metadata failures do not stop the
/// enqueue: the worker's update is a no-op on a missing row, and the next
/// upsert after the TTL repairs it.
pub async fn ingest_items(
    items: &[FeedItem],
    ctx: &PollContext,
    producer: &mut ConnectionManager,
) -> PollStats {
    let mut stats = PollStats::default();
    for item in items {
        stats.items += 1;
        match ctx.gate.check_and_reserve(&item.link).await {
            Ok(true) => {}
            Ok(false) => {
                stats.duplicates += 1;
                debug!(url = %item.link, "duplicate link, skipping");
                continue;
            }
            Err(err) => {
                stats.gate_failures += 1;
                warn!(url = %item.link, error = %err, "dedup check failed, skipping item");
                continue;
            }
        }
        stats.accepted += 1;

        if let Err(err) = ctx.store.upsert_metadata(&ArticleMetadata::from(item)).await {
            stats.store_failures += 1;
            warn!(url = %item.link, error = %err, "failed to save article metadata");
        }

        match producer
            .publish(&ctx.feed_queue, &OutboundMessage::text(&item.link))
            .await
        {
            Ok(()) => {
                stats.enqueued += 1;
                info!(url = %item.link, title = %item.title, "queued article");
            }
            Err(err) => {
                stats.enqueue_failures += 1;
                warn!(url = %item.link, error = %err, "failed to enqueue article");
            }
        }
    }
    stats
}
