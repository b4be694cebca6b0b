use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ingest_core::queue::Broker;
use ingest_core::{
    ArticleExtractor, ArticleMetadata, ArticleStore, CleanEvent, Extractor, ExtractorRegistry, Mark,
    MemoryArticleStore, MemoryBroker, OutboundMessage, Priority, RestartPolicy, SourceMatcher, Topology, Worker,
    WorkerContext, WorkerPool, WorkerState,
};
use reqwest::Client;
use tokio::sync::Notify;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FEED: &str = "rss-feed";
const CLEAN: &str = "rss-clean";

fn policy() -> RestartPolicy {
    RestartPolicy {
        max_restarts: 3,
        backoff: Duration::from_millis(10),
    }
}

fn context(broker: &MemoryBroker, store: &MemoryArticleStore, registry: ExtractorRegistry) -> WorkerContext {
    WorkerContext {
        broker: Arc::new(broker.clone()),
        topology: Topology::new([FEED, CLEAN], 1),
        registry: Arc::new(registry),
        store: Arc::new(store.clone()),
        feed_queue: FEED.into(),
        clean_queue: CLEAN.into(),
        clean_publish_retries: 1,
    }
}

async fn seed(store: &MemoryArticleStore, url: &str) {
    store
        .upsert_metadata(&ArticleMetadata {
            url: url.into(),
            title: "Seeded".into(),
            published_at: Utc::now(),
            image_url: None,
        })
        .await
        .unwrap();
}

async fn enqueue(broker: &MemoryBroker, url: &str) {
    let session = broker.open().await.unwrap();
    session.declare_queue(FEED).await.unwrap();
    session.publish(FEED, &OutboundMessage::text(url)).await.unwrap();
    session.close().await.unwrap();
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn extracts_stores_and_publishes_through_the_pool() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/read/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><head><script type="application/ld+json">
               {"@type":"NewsArticle","articleBody":"Harga beras naik di pasar induk"}
               </script></head><body></body></html>"#,
        ))
        .mount(&server)
        .await;

    let host = url::Url::parse(&server.uri()).unwrap().host_str().unwrap().to_owned();
    let mut registry = ExtractorRegistry::new();
    registry.register(
        SourceMatcher::host(host),
        Arc::new(ArticleExtractor::new("local", Client::new(), Vec::new())),
    );

    let broker = MemoryBroker::new();
    let store = MemoryArticleStore::new();
    let url = format!("{}/read/1", server.uri());
    seed(&store, &url).await;
    enqueue(&broker, &url).await;

    let pool = WorkerPool::spawn(context(&broker, &store, registry), 2, policy());
    wait_for("ack", || broker.acked() == 1).await;
    let reports = pool.stop().await.unwrap();

    assert!(reports.iter().all(|r| r.state == WorkerState::Stopped));
    let row = store.find(&url).await.unwrap().unwrap();
    assert_eq!(row.content.as_deref(), Some("Harga beras naik di pasar induk"));
    assert_eq!(row.mark, Mark::Complete);
    assert_eq!(row.priority, Priority::Short);

    let clean = broker.published(CLEAN);
    assert_eq!(clean.len(), 1);
    assert_eq!(
        CleanEvent::from_payload(&clean[0].body).unwrap(),
        CleanEvent::new(url, "Harga beras naik di pasar induk")
    );
    assert_eq!(broker.in_flight(), 0);
}

#[tokio::test]
async fn unknown_source_is_acked_without_side_effects() {
    let broker = MemoryBroker::new();
    let store = MemoryArticleStore::new();
    let url = "https://unknown.example/a";
    seed(&store, url).await;
    let before = store.find(url).await.unwrap().unwrap();
    enqueue(&broker, url).await;

    let pool = WorkerPool::spawn(context(&broker, &store, ExtractorRegistry::new()), 1, policy());
    wait_for("ack", || broker.acked() == 1).await;
    pool.stop().await.unwrap();

    assert_eq!(store.find(url).await.unwrap().unwrap(), before);
    assert!(broker.published(CLEAN).is_empty());
    assert_eq!(broker.ready_count(FEED), 0);
}

struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl Extractor for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    async fn extract(&self, _url: &str) -> ingest_core::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("some text".into())
    }
}

#[tokio::test]
async fn closed_seed_session_is_replaced_before_consuming() {
    let broker = MemoryBroker::new();
    let store = MemoryArticleStore::new();
    let url = "https://news.detik.com/a";
    seed(&store, url).await;
    enqueue(&broker, url).await;

    let extractor = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let mut registry = ExtractorRegistry::new();
    registry.register(SourceMatcher::host("detik.com"), extractor.clone());
    let ctx = context(&broker, &store, registry);

    let seed_session = broker.open().await.unwrap();
    broker.close_sessions();
    let worker = Worker::with_session(0, ctx, seed_session);

    let pool = WorkerPool::spawn_workers(vec![worker], policy());
    wait_for("ack", || broker.acked() == 1).await;
    let reports = pool.stop().await.unwrap();

    assert_eq!(reports[0].state, WorkerState::Stopped);
    assert_eq!(reports[0].reconnects, 1);
    assert_eq!(reports[0].restarts, 0);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.find(url).await.unwrap().unwrap().mark, Mark::Complete);
}

#[tokio::test]
async fn worker_resumes_after_the_broker_drops_it() {
    let broker = MemoryBroker::new();
    let store = MemoryArticleStore::new();
    let mut registry = ExtractorRegistry::new();
    registry.register(
        SourceMatcher::host("detik.com"),
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
        }),
    );

    let pool = WorkerPool::spawn(context(&broker, &store, registry), 1, policy());
    wait_for("worker session", || broker.open_sessions() == 1).await;
    broker.close_sessions();

    let url = "https://detik.com/after-drop";
    seed(&store, url).await;
    enqueue(&broker, url).await;
    wait_for("ack", || broker.acked() == 1).await;
    let reports = pool.stop().await.unwrap();

    assert_eq!(reports[0].state, WorkerState::Stopped);
    assert_eq!(reports[0].restarts, 1);
    assert_eq!(reports[0].processed, 1);
    assert_eq!(broker.published(CLEAN).len(), 1);
}

/// Blocks its first call until released, so a session can be dropped while
/// the delivery is held.
struct Gated {
    entered: Notify,
    release: Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl Extractor for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn extract(&self, _url: &str) -> ingest_core::Result<String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok("body".into())
    }
}

#[tokio::test]
async fn unacked_delivery_is_redelivered_after_disconnect() {
    let broker = MemoryBroker::new();
    let store = MemoryArticleStore::new();
    let url = "https://detik.com/held";
    seed(&store, url).await;
    enqueue(&broker, url).await;

    let extractor = Arc::new(Gated {
        entered: Notify::new(),
        release: Notify::new(),
        calls: AtomicUsize::new(0),
    });
    let mut registry = ExtractorRegistry::new();
    registry.register(SourceMatcher::host("detik.com"), extractor.clone());

    let pool = WorkerPool::spawn(context(&broker, &store, registry), 1, policy());
    extractor.entered.notified().await;
    assert_eq!(broker.in_flight(), 1);

    broker.close_sessions();
    assert_eq!(broker.in_flight(), 0);
    assert_eq!(broker.ready_count(FEED), 1);
    extractor.release.notify_one();

    wait_for("redelivered ack", || broker.acked() == 1).await;
    let reports = pool.stop().await.unwrap();

    assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(reports[0].processed, 2);
    assert_eq!(broker.ready_count(FEED), 0);
    assert_eq!(store.find(url).await.unwrap().unwrap().mark, Mark::Complete);
}

#[tokio::test]
async fn restart_budget_is_bounded() {
    let broker = MemoryBroker::new();
    let store = MemoryArticleStore::new();

    let pool = WorkerPool::spawn(context(&broker, &store, ExtractorRegistry::new()), 1, policy());
    wait_for("worker session", || broker.open_sessions() == 1).await;
    broker.fail_next_opens(10);
    broker.close_sessions();

    let reports = pool.join().await.unwrap();
    assert!(matches!(reports[0].state, WorkerState::GaveUp(_)));
    assert_eq!(reports[0].restarts, 3);
}

#[tokio::test]
async fn idle_disconnects_that_reopen_do_not_exhaust_the_budget() {
    let broker = MemoryBroker::new();
    let store = MemoryArticleStore::new();
    let policy = policy();

    let pool = WorkerPool::spawn(context(&broker, &store, ExtractorRegistry::new()), 1, policy);
    for _ in 0..=policy.max_restarts + 1 {
        wait_for("worker session", || broker.open_sessions() == 1).await;
        broker.close_sessions();
    }
    wait_for("final reopen", || broker.open_sessions() == 1).await;
    assert!(!pool.is_finished());

    let reports = pool.stop().await.unwrap();
    assert_eq!(reports[0].state, WorkerState::Stopped);
    assert_eq!(reports[0].restarts, policy.max_restarts + 2);
    assert_eq!(reports[0].reconnects, policy.max_restarts + 2);
}
