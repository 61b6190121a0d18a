use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crawld_core::{RobotsFetchStatus, RobotsRecord};
use crawld_politeness::PolitenessGate;

mod parser;

pub use parser::Ruleset;

/// Fetches, parses, and caches per-host robots.txt rulesets; answers
/// allow/deny and crawl-delay queries. Single-flight per host: concurrent
/// callers for the same host share one fetch via the per-host mutex. The
/// robots.txt fetch itself goes through the same politeness gate as other
/// fetches on that host.
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    refresh_interval: Duration,
    politeness: Arc<PolitenessGate>,
    default_politeness_interval: Duration,
    entries: DashMap<String, Arc<Mutex<Option<CachedEntry>>>>,
}

struct CachedEntry {
    record: RobotsRecord,
    ruleset: Ruleset,
}

impl RobotsCache {
    pub fn new(
        client: reqwest::Client,
        user_agent: String,
        refresh_interval: Duration,
        politeness: Arc<PolitenessGate>,
        default_politeness_interval: Duration,
    ) -> Self {
        Self {
            client,
            user_agent,
            refresh_interval,
            politeness,
            default_politeness_interval,
            entries: DashMap::new(),
        }
    }

    fn entry_for(&self, host: &str) -> Arc<Mutex<Option<CachedEntry>>> {
        self.entries
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Consults cached rules; fetches `/robots.txt` if none or expired.
    pub async fn is_allowed(&self, host: &str, path_and_query: &str) -> bool {
        let entry_lock = self.entry_for(host);
        let mut guard = entry_lock.lock().await;
        self.ensure_fresh(host, &mut guard).await;
        match guard.as_ref() {
            Some(cached) => match cached.record.fetch_status {
                RobotsFetchStatus::Conservative => false,
                RobotsFetchStatus::NoRestrictions => true,
                RobotsFetchStatus::Ok => cached.ruleset.is_allowed(path_and_query),
            },
            None => true,
        }
    }

    pub async fn crawl_delay(&self, host: &str) -> Option<Duration> {
        let entry_lock = self.entry_for(host);
        let mut guard = entry_lock.lock().await;
        self.ensure_fresh(host, &mut guard).await;
        guard.as_ref().and_then(|c| c.record.crawl_delay)
    }

    async fn ensure_fresh(&self, host: &str, guard: &mut Option<CachedEntry>) {
        let now = chrono::Utc::now();
        let needs_fetch = match guard.as_ref() {
            Some(cached) => cached.record.expires_at <= now,
            None => true,
        };
        if !needs_fetch {
            return;
        }

        let url = format!("https://{host}/robots.txt");
        let fetched = self.fetch_and_parse(host, &url).await;
        let (record, ruleset) = match fetched {
            Ok((status, body)) => {
                if status == 429 {
                    // 429 is not a "no restrictions" 4xx case; retry later, conservative meanwhile.
                    conservative(host, now, self.refresh_interval)
                } else if (400..500).contains(&status) {
                    no_restrictions(host, now, self.refresh_interval)
                } else if (200..300).contains(&status) {
                    if looks_like_html(&body) {
                        warn!(host, "robots.txt body looks like HTML, applying conservative policy");
                        conservative(host, now, self.refresh_interval)
                    } else {
                        let ruleset = parser::parse(&body, &self.user_agent);
                        let crawl_delay = ruleset.crawl_delay;
                        (
                            RobotsRecord {
                                host: host.to_string(),
                                fetched_at: now,
                                expires_at: now + chrono::Duration::from_std(self.refresh_interval).unwrap(),
                                disallow_rules: ruleset.disallow.clone(),
                                allow_rules: ruleset.allow.clone(),
                                crawl_delay,
                                fetch_status: RobotsFetchStatus::Ok,
                            },
                            ruleset,
                        )
                    }
                } else {
                    conservative(host, now, self.refresh_interval)
                }
            }
            Err(e) => {
                debug!(host, error = %e, "robots.txt fetch failed, applying conservative policy");
                conservative(host, now, self.refresh_interval)
            }
        };
        *guard = Some(CachedEntry { record, ruleset });
    }

    async fn fetch_and_parse(&self, host: &str, url: &str) -> anyhow::Result<(u16, String)> {
        self.politeness
            .acquire(host, self.default_politeness_interval, std::future::pending())
            .await;
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok((status, body))
    }
}

fn conservative(host: &str, now: chrono::DateTime<chrono::Utc>, refresh: Duration) -> (RobotsRecord, Ruleset) {
    (
        RobotsRecord {
            host: host.to_string(),
            fetched_at: now,
            expires_at: now + chrono::Duration::from_std(refresh).unwrap(),
            disallow_rules: vec![],
            allow_rules: vec![],
            crawl_delay: None,
            fetch_status: RobotsFetchStatus::Conservative,
        },
        Ruleset::default(),
    )
}

fn no_restrictions(host: &str, now: chrono::DateTime<chrono::Utc>, refresh: Duration) -> (RobotsRecord, Ruleset) {
    (
        RobotsRecord {
            host: host.to_string(),
            fetched_at: now,
            expires_at: now + chrono::Duration::from_std(refresh).unwrap(),
            disallow_rules: vec![],
            allow_rules: vec![],
            crawl_delay: None,
            fetch_status: RobotsFetchStatus::NoRestrictions,
        },
        Ruleset::default(),
    )
}

fn looks_like_html(body: &str) -> bool {
    let trimmed = body.trim_start().to_lowercase();
    trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_html_waf_page() {
        assert!(looks_like_html("<!DOCTYPE html>\n<html><body>blocked</body></html>"));
        assert!(!looks_like_html("User-agent: *\nDisallow: /private"));
    }
}
