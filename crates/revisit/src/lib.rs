use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crawld_core::UrlRecord;

/// Computes the next due time for a successfully-visited record.
///
/// Only called on the successful-visit path (`complete_success`); transient
/// failures go through the queue store's own retry/backoff path and never
/// touch the revisit interval. A sink rejection is also not a "no change"
/// signal by itself — callers must pass `content_changed = false` for a
/// rejected document even if its hash differs from the last visit, so a
/// rejection can never shorten the interval.
pub struct RevisitPolicy {
    min_interval: Duration,
    max_interval: Duration,
    default_interval: Duration,
    increase_factor: f64,
    decrease_factor: f64,
    jitter_pct: f64,
}

impl RevisitPolicy {
    pub fn new(
        min_interval: Duration,
        max_interval: Duration,
        default_interval: Duration,
        increase_factor: f64,
        decrease_factor: f64,
        jitter_pct: f64,
    ) -> Self {
        Self {
            min_interval,
            max_interval,
            default_interval,
            increase_factor,
            decrease_factor,
            jitter_pct,
        }
    }

    /// The due time for the next visit of `record`, given whether this
    /// visit's content differs from the last known content hash.
    pub fn next_crawl(
        &self,
        record: &UrlRecord,
        content_changed: bool,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let interval = if record.last_crawl.is_none() {
            self.default_interval
        } else {
            let previous = previous_interval(record).unwrap_or(self.default_interval);
            let grown = if content_changed {
                previous.mul_f64(self.decrease_factor)
            } else {
                previous.mul_f64(self.increase_factor)
            };
            let max_cap = self.priority_capped_max(record.priority);
            clamp(grown, self.min_interval, max_cap)
        };

        let jittered = clamp(self.apply_jitter(interval), self.min_interval, self.max_interval);
        now + chrono::Duration::from_std(jittered).unwrap_or(chrono::Duration::zero())
    }

    /// Higher-priority records get a tighter revisit ceiling: the
    /// configured `max_interval` is halved per priority point above zero,
    /// floored at `min_interval`. A priority-0 record uses the full
    /// `max_interval`.
    fn priority_capped_max(&self, priority: i64) -> Duration {
        let scale = 0.5_f64.powi(priority.max(0) as i32);
        let capped = self.max_interval.mul_f64(scale);
        capped.max(self.min_interval)
    }

    fn apply_jitter(&self, interval: Duration) -> Duration {
        if self.jitter_pct <= 0.0 {
            return interval;
        }
        let mut rng = rand::thread_rng();
        let factor = rng.gen_range((1.0 - self.jitter_pct)..=(1.0 + self.jitter_pct));
        interval.mul_f64(factor.max(0.0))
    }
}

fn previous_interval(record: &UrlRecord) -> Option<Duration> {
    let last = record.last_crawl?;
    let next = record.next_crawl?;
    if next > last {
        (next - last).to_std().ok()
    } else {
        None
    }
}

fn clamp(value: Duration, min: Duration, max: Duration) -> Duration {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawld_core::UrlStatus;

    fn base_record(last_crawl: Option<DateTime<Utc>>, next_crawl: Option<DateTime<Utc>>, priority: i64) -> UrlRecord {
        UrlRecord {
            url: "https://example.test/".into(),
            host: "example.test".into(),
            status: UrlStatus::Visited,
            priority,
            depth: 0,
            first_seen: Utc::now(),
            last_crawl,
            next_crawl,
            retry_after: None,
            retry_count: 0,
            content_hash: None,
            etag: None,
            last_modified: None,
            http_status: Some(200),
            failure_reason: None,
            canonical_of: None,
            owner: None,
            claimed_at: None,
        }
    }

    #[test]
    fn first_visit_uses_default_interval() {
        let policy = RevisitPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(86400 * 30),
            Duration::from_secs(3600),
            2.0,
            0.5,
            0.0,
        );
        let record = base_record(None, None, 0);
        let now = Utc::now();
        let next = policy.next_crawl(&record, false, now);
        assert_eq!((next - now).num_seconds(), 3600);
    }

    #[test]
    fn unchanged_content_doubles_interval_across_visits() {
        let policy = RevisitPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
            2.0,
            0.5,
            0.0,
        );
        let now = Utc::now();

        // visit 1: no prior last_crawl -> default interval (1h)
        let mut record = base_record(None, None, 0);
        let next1 = policy.next_crawl(&record, false, now);
        assert_eq!((next1 - now).num_seconds(), 3600);

        // visit 2: previous interval was 1h, unchanged -> 2h
        record.last_crawl = Some(now);
        record.next_crawl = Some(next1);
        let now2 = next1;
        let next2 = policy.next_crawl(&record, false, now2);
        assert_eq!((next2 - now2).num_seconds(), 7200);

        // visit 3: previous interval was 2h, unchanged -> 4h
        record.last_crawl = Some(now2);
        record.next_crawl = Some(next2);
        let now3 = next2;
        let next3 = policy.next_crawl(&record, false, now3);
        assert_eq!((next3 - now3).num_seconds(), 14400);
    }

    #[test]
    fn changed_content_shrinks_interval_but_not_below_minimum() {
        let policy = RevisitPolicy::new(
            Duration::from_secs(600),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
            2.0,
            0.1,
            0.0,
        );
        let now = Utc::now();
        let last = now - chrono::Duration::hours(1);
        let record = base_record(Some(last), Some(now), 0);
        let next = policy.next_crawl(&record, true, now);
        // previous interval 1h * 0.1 = 360s, floored at the 600s minimum
        assert_eq!((next - now).num_seconds(), 600);
    }

    #[test]
    fn higher_priority_caps_max_interval_lower() {
        let policy = RevisitPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(3600),
            100.0,
            0.5,
            0.0,
        );
        let now = Utc::now();
        let last = now - chrono::Duration::hours(1);
        let record = base_record(Some(last), Some(now), 3);
        let next = policy.next_crawl(&record, false, now);
        // priority 3 caps max_interval at 24h / 8 = 3h, well below the
        // uncapped 100h growth.
        assert_eq!((next - now).num_seconds(), 3 * 3600);
    }
}
