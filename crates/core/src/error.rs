use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("page body empty or below minimum length")]
    ParseEmpty,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("redirect chain exceeded cap of {0}")]
    RedirectChainExceeded(u8),

    #[error("redirect to host outside allowlist: {0}")]
    RedirectOffAllowlist(String),

    #[error("disallowed by robots.txt: {0}")]
    RobotsDenied(String),

    #[error("sink rejected document: {0}")]
    SinkRejected(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// Short tag suitable for `failure_reason` on a queue record.
    pub fn failure_tag(&self) -> &'static str {
        match self {
            CrawlError::Network(_) => "network",
            CrawlError::Timeout(_) => "timeout",
            CrawlError::InvalidUrl(_) => "invalid_url",
            CrawlError::Parse(_) => "parse",
            CrawlError::ParseEmpty => "parse_empty",
            CrawlError::Storage(_) => "storage",
            CrawlError::Config(_) => "config",
            CrawlError::BodyTooLarge { .. } => "body_too_large",
            CrawlError::UnsupportedType(_) => "unsupported_type",
            CrawlError::RedirectChainExceeded(_) => "redirect_chain_exceeded",
            CrawlError::RedirectOffAllowlist(_) => "redirect_off_allowlist",
            CrawlError::RobotsDenied(_) => "robots",
            CrawlError::SinkRejected(_) => "sink_rejected",
            CrawlError::Other(_) => "other",
        }
    }

    /// Whether a worker should retry this kind of failure (transient) or
    /// terminate the record (permanent).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CrawlError::Network(_) | CrawlError::Timeout(_) | CrawlError::Storage(_)
        )
    }
}
