use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Proof that the caller may now issue one request to the permit's host.
pub struct Permit {
    pub host: String,
}

/// Enforces at most one outgoing request per host every `min_interval`.
/// Concurrent callers for different hosts never block each other; for the
/// same host they serialize on a per-host mutex (central lock only on
/// host-entry creation, per the coarse-lock-on-insert pattern).
pub struct PolitenessGate {
    hosts: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl Default for PolitenessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PolitenessGate {
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
        }
    }

    fn entry_for(&self, host: &str) -> Arc<Mutex<Option<Instant>>> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Blocks until `min_interval` has elapsed since the host's last granted
    /// request, or until `cancel` resolves first. Returns `None` if
    /// cancelled; in that case no stamp is recorded.
    pub async fn acquire<C>(&self, host: &str, min_interval: Duration, cancel: C) -> Option<Permit>
    where
        C: Future<Output = ()>,
    {
        let lock = self.entry_for(host);
        let mut guard = lock.lock().await;

        let wait = match *guard {
            Some(last) => min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        };

        if !wait.is_zero() {
            tokio::pin!(cancel);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut cancel => return None,
            }
        }

        *guard = Some(Instant::now());
        Some(Permit {
            host: host.to_string(),
        })
    }

    /// Last recorded request time for a host, if any requests have been made.
    pub fn last_request_at(&self, host: &str) -> Option<Instant> {
        self.hosts.get(host).and_then(|e| {
            e.try_lock()
                .ok()
                .and_then(|guard| *guard)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn serializes_same_host() {
        let gate = PolitenessGate::new();
        let start = Instant::now();
        gate.acquire("example.test", Duration::from_millis(50), pending())
            .await
            .unwrap();
        gate.acquire("example.test", Duration::from_millis(50), pending())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn different_hosts_do_not_block_each_other() {
        let gate = PolitenessGate::new();
        gate.acquire("a.test", Duration::from_secs(10), pending())
            .await
            .unwrap();
        let start = Instant::now();
        gate.acquire("b.test", Duration::from_secs(10), pending())
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancellation_does_not_stamp() {
        let gate = PolitenessGate::new();
        gate.acquire("example.test", Duration::from_secs(10), pending())
            .await
            .unwrap();
        let cancelled = gate
            .acquire("example.test", Duration::from_secs(10), async {})
            .await;
        assert!(cancelled.is_none());
    }
}
