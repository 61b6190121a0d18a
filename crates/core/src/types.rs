use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a URL record in the Queue Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Pending,
    InFlight,
    Visited,
    Failed,
    Excluded,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::InFlight => "in_flight",
            UrlStatus::Visited => "visited",
            UrlStatus::Failed => "failed",
            UrlStatus::Excluded => "excluded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UrlStatus::Pending),
            "in_flight" => Some(UrlStatus::InFlight),
            "visited" => Some(UrlStatus::Visited),
            "failed" => Some(UrlStatus::Failed),
            "excluded" => Some(UrlStatus::Excluded),
            _ => None,
        }
    }
}

/// A URL record as persisted by the Queue Store. Keyed by canonical URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    pub url: String,
    pub host: String,
    pub status: UrlStatus,
    pub priority: i64,
    pub depth: u32,
    pub first_seen: chrono::DateTime<chrono::Utc>,
    pub last_crawl: Option<chrono::DateTime<chrono::Utc>>,
    pub next_crawl: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_after: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub http_status: Option<u16>,
    pub failure_reason: Option<String>,
    pub canonical_of: Option<String>,
    pub owner: Option<String>,
    pub claimed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Attributes supplied on `upsert`. Fields left `None` are not touched on merge.
/// Host is not here: `upsert` takes it as a required positional argument, so
/// there's no divergent second copy to keep in sync.
#[derive(Debug, Clone, Default)]
pub struct UpsertAttrs {
    pub priority: Option<i64>,
    pub depth: Option<u32>,
    pub canonical_of: Option<String>,
}

/// A cached robots.txt ruleset for one host.
#[derive(Debug, Clone)]
pub struct RobotsRecord {
    pub host: String,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub disallow_rules: Vec<String>,
    pub allow_rules: Vec<String>,
    pub crawl_delay: Option<std::time::Duration>,
    pub fetch_status: RobotsFetchStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotsFetchStatus {
    Ok,
    NoRestrictions,
    Conservative,
}

/// Outcome of a single fetch attempt, per spec's Fetcher contract.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fresh {
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        final_url: String,
        content_type: Option<String>,
    },
    NotModified {
        status: u16,
        headers: HashMap<String, String>,
        final_url: String,
    },
    RedirectChainExceeded,
    RedirectOffAllowlist {
        host: String,
    },
    TransientFailure {
        reason: &'static str,
        retry_after: Option<std::time::Duration>,
    },
    PermanentFailure {
        reason: &'static str,
    },
}

/// Request-scoped fetch parameters.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// A discovered outbound link, pre-filter.
#[derive(Debug, Clone)]
pub struct ExtractedLink {
    pub url: String,
    pub anchor_text: Option<String>,
    pub is_external: bool,
}

/// Page metadata surfaced by the Parser, generically useful (no dark-web
/// entity extraction or form/CAPTCHA detection).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMetadata {
    pub meta_description: Option<String>,
    pub meta_keywords: Vec<String>,
    pub language: Option<String>,
    pub open_graph: HashMap<String, String>,
}

/// What the Parser produces from one fetched HTML document.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub title: Option<String>,
    pub main_text: String,
    pub content_hash: String,
    pub canonical_url: String,
    pub links: Vec<ExtractedLink>,
    pub metadata: PageMetadata,
}

/// The normalized document handed to the Sink Adapter (C10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub final_url: String,
    pub canonical_url: String,
    pub title: Option<String>,
    pub main_text: String,
    pub content_hash: String,
    pub fetched_at: chrono::DateTime<chrono::Utc>,
    pub metadata: PageMetadata,
}

/// Outcome surfaced by the Sink Adapter to a worker.
#[derive(Debug, Clone)]
pub enum SinkOutcome {
    Accepted,
    Rejected(String),
}

/// Aggregate counts returned by `Queue Store::stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub by_status: HashMap<String, i64>,
    pub by_priority: HashMap<i64, i64>,
}
