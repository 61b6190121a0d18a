use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tracing::debug;

use crawld_core::UrlRecord;
use crawld_queue::QueueStore;

/// Claims ready work for workers, skipping hosts another worker currently
/// holds so a busy host never blocks the scheduler from handing out other
/// ready work. Host tracking is scheduler-local (not persisted): it exists
/// only to avoid dispatching two concurrent claims to the same host, which
/// the politeness gate would otherwise just serialize on anyway, wasting a
/// worker slot on a wait instead of other ready work.
///
/// Ranking (priority DESC, next_crawl ASC, first_seen ASC) lives in the
/// queue store's `claim_next` query; the scheduler doesn't re-rank. Low
/// priority records are never hard-partitioned away from high priority
/// ones, so once the high-priority backlog for a host drains, lower
/// priority ready records surface on the same ordered claim — no separate
/// anti-starvation mechanism is needed on top of that.
pub struct Scheduler {
    queue: Arc<QueueStore>,
    active_hosts: DashSet<String>,
}

impl Scheduler {
    pub fn new(queue: Arc<QueueStore>) -> Self {
        Self {
            queue,
            active_hosts: DashSet::new(),
        }
    }

    /// Claims the next ready record for `worker_id`, skipping hosts
    /// currently held by another claim. Returns `None` both when the queue
    /// has no ready record and when every ready record's host is currently
    /// active — callers should treat both as "back off", never spin.
    pub async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> anyhow::Result<Option<UrlRecord>> {
        let excluded: Vec<String> = self.active_hosts.iter().map(|h| h.clone()).collect();
        let record = self
            .queue
            .claim_next_excluding(worker_id, now, &excluded)
            .await?;
        if let Some(rec) = &record {
            self.active_hosts.insert(rec.host.clone());
            debug!(url = %rec.url, host = %rec.host, worker_id, "claimed for worker");
        }
        Ok(record)
    }

    /// Releases a host after a worker finishes the unit of work for it
    /// (success, failure, or exclusion), making it eligible for claiming
    /// again.
    pub fn release(&self, host: &str) {
        self.active_hosts.remove(host);
    }

    /// Number of hosts currently checked out to a worker.
    pub fn active_host_count(&self) -> usize {
        self.active_hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawld_core::UpsertAttrs;

    async fn scheduler_with_two_hosts() -> Scheduler {
        let store = QueueStore::with_pool_size(":memory:", 1).await.unwrap();
        store.run_migrations().await.unwrap();
        store
            .upsert("https://a.test/", "a.test", UpsertAttrs::default())
            .await
            .unwrap();
        store
            .upsert("https://b.test/", "b.test", UpsertAttrs::default())
            .await
            .unwrap();
        Scheduler::new(Arc::new(store))
    }

    #[tokio::test]
    async fn second_claim_skips_active_host() {
        let scheduler = scheduler_with_two_hosts().await;
        let now = Utc::now();
        let first = scheduler.claim("worker-1", now).await.unwrap().unwrap();
        let second = scheduler.claim("worker-2", now).await.unwrap().unwrap();
        assert_ne!(first.host, second.host);
    }

    #[tokio::test]
    async fn release_allows_reclaiming_host() {
        let scheduler = scheduler_with_two_hosts().await;
        let now = Utc::now();
        let first = scheduler.claim("worker-1", now).await.unwrap().unwrap();
        scheduler.release(&first.host);
        assert_eq!(scheduler.active_host_count(), 0);
    }
}
