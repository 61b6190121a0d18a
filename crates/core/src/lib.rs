pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, RetryConfig, SinkConfig};
pub use error::CrawlError;
pub use types::*;
