pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod feed;
pub mod poller;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::{PipelineConfig, SourceConfig};
pub use connection::{ConnectionManager, Topology};
pub use dedup::{ContentHash, DedupCache, DedupGate, MemoryCache, RedisCache};
pub use error::{IngestError, Result};
pub use extract::{ArticleExtractor, Extractor, ExtractorRegistry, SourceMatcher};
pub use feed::{fetch_feed, FeedItem};
pub use poller::{ingest_items, poll_once, spawn_poller, PollConfig, PollContext, PollStats, PollerHandle};
pub use queue::{AmqpBroker, Broker, BrokerSession, CleanEvent, Delivery, MemoryBroker, OutboundMessage};
pub use store::{
    ArticleMetadata, ArticleRecord, ArticleStore, ContentUpdate, Mark, MemoryArticleStore, PgArticleStore,
    Priority,
};
pub use worker::{
    process_delivery, Outcome, PoolHandle, RestartPolicy, StoreOutcome, Worker, WorkerContext, WorkerExit,
    WorkerPool, WorkerReport, WorkerState,
};
