//! Exercises the frontier → scheduler → worker pipeline end to end against
//! an in-memory SQLite database, without any network access.

use std::sync::Arc;

use chrono::Utc;
use crawld_core::UpsertAttrs;
use crawld_queue::QueueStore;
use crawld_revisit::RevisitPolicy;
use crawld_scheduler::Scheduler;

async fn memory_store() -> QueueStore {
    let store = QueueStore::with_pool_size(":memory:", 4).await.unwrap();
    store.run_migrations().await.unwrap();
    store
}

#[tokio::test]
async fn scheduler_excludes_active_host_until_released() {
    let store = memory_store().await;
    store
        .upsert(
            "https://a.test/",
            "a.test",
            UpsertAttrs { priority: Some(5), ..Default::default() },
        )
        .await
        .unwrap();
    store
        .upsert(
            "https://a.test/other",
            "a.test",
            UpsertAttrs { priority: Some(1), ..Default::default() },
        )
        .await
        .unwrap();
    store
        .upsert(
            "https://b.test/",
            "b.test",
            UpsertAttrs { priority: Some(1), ..Default::default() },
        )
        .await
        .unwrap();

    let queue = Arc::new(store);
    let scheduler = Scheduler::new(Arc::clone(&queue));
    let now = Utc::now();

    // Highest-priority record on a.test claims first.
    let first = scheduler.claim("worker-1", now).await.unwrap().unwrap();
    assert_eq!(first.url, "https://a.test/");

    // a.test is held active; a second ready record on the same host must
    // not be handed out, but b.test (a different host) still is.
    let second = scheduler.claim("worker-2", now).await.unwrap().unwrap();
    assert_eq!(second.host, "b.test");
    assert!(scheduler.claim("worker-3", now).await.unwrap().is_none());

    scheduler.release(&first.host);
    let third = scheduler.claim("worker-3", now).await.unwrap().unwrap();
    assert_eq!(third.url, "https://a.test/other");
}

#[tokio::test]
async fn full_visit_schedules_revisit_and_updates_stats() {
    let store = memory_store().await;
    store
        .upsert("https://example.test/", "example.test", UpsertAttrs::default())
        .await
        .unwrap();

    let queue = Arc::new(store);
    let scheduler = Scheduler::new(Arc::clone(&queue));
    let revisit = RevisitPolicy::new(
        std::time::Duration::from_secs(60),
        std::time::Duration::from_secs(30 * 86400),
        std::time::Duration::from_secs(3600),
        2.0,
        0.5,
        0.0,
    );

    let now = Utc::now();
    let record = scheduler.claim("worker-1", now).await.unwrap().unwrap();
    let next_crawl = revisit.next_crawl(&record, true, now);

    queue
        .complete_success(&record.url, Some("hash-1"), 200, None, None, None, next_crawl)
        .await
        .unwrap();
    scheduler.release(&record.host);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.by_status.get("visited").copied().unwrap_or(0), 1);
    assert_eq!(stats.by_status.get("in_flight").copied().unwrap_or(0), 0);

    let updated = queue.get(&record.url).await.unwrap().unwrap();
    assert_eq!(updated.content_hash.as_deref(), Some("hash-1"));
    assert!(updated.next_crawl.is_some());
}

#[tokio::test]
async fn stale_in_flight_is_reclaimed_before_workers_start() {
    let store = memory_store().await;
    store
        .upsert("https://c.test/", "c.test", UpsertAttrs::default())
        .await
        .unwrap();

    let claimed_at = Utc::now() - chrono::Duration::minutes(20);
    store.claim_next("worker-1", claimed_at).await.unwrap();

    let reclaimed = store
        .reclaim_stale(Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let scheduler = Scheduler::new(Arc::new(store));
    let claimed = scheduler.claim("worker-2", Utc::now()).await.unwrap();
    assert!(claimed.is_some());
}

#[tokio::test]
async fn discovered_link_merges_without_lowering_priority_or_depth() {
    let store = memory_store().await;
    store
        .upsert(
            "https://example.test/a",
            "example.test",
            UpsertAttrs { priority: Some(5), depth: Some(2), ..Default::default() },
        )
        .await
        .unwrap();

    // A rediscovery from a shallower seed should not raise depth back up,
    // and a lower-priority rediscovery should not lower priority.
    store
        .upsert(
            "https://example.test/a",
            "example.test",
            UpsertAttrs { priority: Some(1), depth: Some(0), ..Default::default() },
        )
        .await
        .unwrap();

    let record = store.get("https://example.test/a").await.unwrap().unwrap();
    assert_eq!(record.priority, 5);
    assert_eq!(record.depth, 0);
}
