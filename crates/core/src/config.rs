use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub seed_urls: Vec<String>,
    pub host_allowlist: Vec<String>,
    #[serde(default)]
    pub path_priority_rules: Vec<PathPriorityRule>,
    #[serde(default = "default_accepted_content_types")]
    pub accepted_content_types: Vec<String>,
    pub fetch: FetchConfigSchema,
    pub politeness: PolitenessConfig,
    pub revisit: RevisitConfig,
    pub retry: RetryConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    pub data_dir: String,
    #[serde(default = "default_depth_cap")]
    pub depth_cap: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages_per_run: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathPriorityRule {
    pub pattern: String,
    pub priority: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfigSchema {
    pub user_agent: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolitenessConfig {
    #[serde(default = "default_politeness_interval")]
    pub default_interval_secs: u64,
    #[serde(default = "default_robots_refresh")]
    pub robots_refresh_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RevisitConfig {
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    #[serde(default = "default_default_interval")]
    pub default_interval_secs: u64,
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SinkConfig {
    Http { endpoint: String },
    File { path: String },
}

/// Rules for collapsing query-only URL permutations known to be duplicates
/// before they're enqueued, so tracking/session params don't fork one page
/// into many frontier records.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DedupConfig {
    /// Query parameter names stripped from discovered links before enqueue.
    #[serde(default)]
    pub query_param_denylist: Vec<String>,
}

fn default_accepted_content_types() -> Vec<String> {
    vec!["text/html".to_string()]
}
fn default_depth_cap() -> u32 {
    10
}
fn default_max_pages() -> u64 {
    u64::MAX
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_redirects() -> u8 {
    5
}
fn default_politeness_interval() -> u64 {
    2
}
fn default_robots_refresh() -> u64 {
    24 * 3600
}
fn default_min_interval() -> u64 {
    3600
}
fn default_max_interval() -> u64 {
    7 * 24 * 3600
}
fn default_default_interval() -> u64 {
    3600
}
fn default_increase_factor() -> f64 {
    2.0
}
fn default_decrease_factor() -> f64 {
    0.5
}
fn default_jitter_pct() -> f64 {
    0.1
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_backoff() -> u64 {
    10
}
fn default_max_backoff() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Priority boost for a discovered link's path, highest matching rule wins.
    pub fn priority_for_path(&self, path: &str) -> i64 {
        let mut best: Option<&PathPriorityRule> = None;
        for rule in &self.path_priority_rules {
            if path.contains(&rule.pattern)
                && best.map(|b| rule.priority > b.priority).unwrap_or(true)
            {
                best = Some(rule);
            }
        }
        best.map(|r| r.priority).unwrap_or(0)
    }

    pub fn host_allowed(&self, host: &str) -> bool {
        self.host_allowlist.iter().any(|h| h == host)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host_allowlist.is_empty() {
            return Err("host_allowlist must not be empty".to_string());
        }
        if self.seed_urls.is_empty() {
            return Err("seed_urls must not be empty".to_string());
        }
        if self.fetch.user_agent.trim().is_empty() {
            return Err("fetch.user_agent must not be empty".to_string());
        }
        Ok(())
    }
}

/// Open Graph style key/value metadata, kept generic rather than fixed fields.
pub type OpenGraphMap = HashMap<String, String>;
