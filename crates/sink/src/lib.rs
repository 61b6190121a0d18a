use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crawld_core::{CrawlError, Document, SinkOutcome};

/// Destination for successfully-parsed documents. A rejection is not an
/// error: the visit still counts as successful for scheduling purposes, the
/// document just isn't kept downstream.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn submit(&self, document: &Document) -> Result<SinkOutcome, CrawlError>;
}

/// Posts each document as JSON to a configured HTTP endpoint. A non-2xx
/// response is treated as a rejection, not a transient failure — the sink
/// owns the decision of whether to retry internally; the crawler doesn't
/// resubmit.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn submit(&self, document: &Document) -> Result<SinkOutcome, CrawlError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(document)
            .send()
            .await
            .map_err(|e| CrawlError::Network(e.to_string()))?;

        if resp.status().is_success() {
            debug!(url = %document.final_url, "sink accepted");
            Ok(SinkOutcome::Accepted)
        } else {
            let reason = format!("http_{}", resp.status().as_u16());
            warn!(url = %document.final_url, %reason, "sink rejected");
            Ok(SinkOutcome::Rejected(reason))
        }
    }
}

/// Appends each document as one JSON line to a file. Rejects only when the
/// write itself fails (disk full, permissions) — there's no external
/// acceptance decision to make for a plain file.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CrawlError> {
        let path = path.into();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| CrawlError::Storage(e.to_string()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn submit(&self, document: &Document) -> Result<SinkOutcome, CrawlError> {
        let mut line =
            serde_json::to_string(document).map_err(|e| CrawlError::Storage(e.to_string()))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        match file.write_all(line.as_bytes()).await {
            Ok(()) => Ok(SinkOutcome::Accepted),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "sink write failed");
                Ok(SinkOutcome::Rejected(format!("write_error: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crawld_core::PageMetadata;

    fn sample_document() -> Document {
        Document {
            final_url: "https://example.test/page".into(),
            canonical_url: "https://example.test/page".into(),
            title: Some("Example".into()),
            main_text: "Hello world".into(),
            content_hash: "abc123".into(),
            fetched_at: Utc::now(),
            metadata: PageMetadata::default(),
        }
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = std::env::temp_dir().join(format!("crawld-sink-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("out.jsonl");

        let sink = FileSink::open(&path).await.unwrap();
        let doc = sample_document();
        let outcome = sink.submit(&doc).await.unwrap();
        assert!(matches!(outcome, SinkOutcome::Accepted));

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("Hello world"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
