use std::sync::Arc;

use anyhow::Context;
use ingest_core::{
    spawn_poller, AmqpBroker, ArticleStore, ConnectionManager, DedupGate, ExtractorRegistry, PgArticleStore,
    PipelineConfig, PollConfig, PollContext, RedisCache, RestartPolicy, Topology, WorkerContext, WorkerPool,
    WorkerState,
};
use reqwest::{redirect, ClientBuilder};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USER_AGENT: &str = concat!("ingestd/", env!("CARGO_PKG_VERSION"));

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            warn!(error = %err, "failed to read .env file");
        }
    }

    let config_path = std::env::var("INGEST_CONFIG").unwrap_or_else(|_| "ingest.json".into());
    let config = PipelineConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;
    config.validate().context("invalid pipeline config")?;

    let store = PgArticleStore::connect(&config.db_dsn)
        .await
        .context("failed to connect to the article store")?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare the article table")?;
    let store: Arc<dyn ArticleStore> = Arc::new(store);

    let cache = RedisCache::connect(&config.cache_addr)
        .await
        .context("failed to connect to the dedup cache")?;
    let gate = DedupGate::new(Arc::new(cache), config.dedup_ttl());

    let broker = Arc::new(AmqpBroker::new(config.broker_url.clone()));
    let topology = Topology::new([config.feed_queue.clone(), config.clean_queue.clone()], config.prefetch);
    let mut producer = ConnectionManager::new(broker.clone(), topology.clone());
    producer
        .ensure_open()
        .await
        .context("failed to open the producer session")?;

    let client = ClientBuilder::new()
        .redirect(redirect::Policy::limited(5))
        .timeout(config.request_timeout())
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")?;
    let registry = ExtractorRegistry::from_sources(&client, &config.sources);
    info!(sources = registry.len(), "extractors registered");

    let pool = WorkerPool::spawn(
        WorkerContext {
            broker,
            topology,
            registry: Arc::new(registry),
            store: store.clone(),
            feed_queue: config.feed_queue.clone(),
            clean_queue: config.clean_queue.clone(),
            clean_publish_retries: config.clean_publish_retries,
        },
        config.worker_count,
        RestartPolicy {
            max_restarts: config.max_worker_restarts,
            backoff: config.restart_backoff(),
        },
    );

    let poller = spawn_poller(
        config.feed_urls.clone(),
        PollConfig {
            interval: config.poll_interval(),
        },
        client,
        PollContext {
            gate,
            store,
            feed_queue: config.feed_queue.clone(),
        },
        producer,
    );

    shutdown_signal().await;
    info!("shutdown requested");

    if let Err(err) = poller.stop().await {
        error!(error = %err, "poller task failed");
    }
    let reports = pool.stop().await.context("worker task failed")?;
    for report in &reports {
        match &report.state {
            WorkerState::Stopped => info!(
                worker = report.id,
                processed = report.processed,
                restarts = report.restarts,
                reconnects = report.reconnects,
                "worker finished"
            ),
            WorkerState::Fatal(reason) | WorkerState::GaveUp(reason) => warn!(
                worker = report.id,
                processed = report.processed,
                restarts = report.restarts,
                reason = %reason,
                "worker exited early"
            ),
        }
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("INGEST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
