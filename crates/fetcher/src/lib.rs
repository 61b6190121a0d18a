use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH, RETRY_AFTER};
use tracing::{debug, warn};
use url::Url;

use crawld_core::{CrawlError, FetchOutcome, FetchRequest};

/// Executes a single HTTP GET with well-defined timeout, redirect, and
/// classification behavior. Redirects are followed manually (the underlying
/// client has auto-redirect disabled) so each hop can be checked against the
/// host allowlist before proceeding.
pub struct Fetcher {
    client: reqwest::Client,
    accepted_content_types: Vec<String>,
    max_body_bytes: usize,
    max_redirects: u8,
}

impl Fetcher {
    pub fn new(
        user_agent: &str,
        request_timeout: Duration,
        accepted_content_types: Vec<String>,
        max_body_bytes: usize,
        max_redirects: u8,
    ) -> Result<Self, CrawlError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .default_headers(headers)
            .user_agent(user_agent)
            .build()
            .map_err(|e| CrawlError::Network(e.to_string()))?;

        Ok(Self {
            client,
            accepted_content_types,
            max_body_bytes,
            max_redirects,
        })
    }

    /// Performs the GET, manually following redirects subject to `is_allowed_host`.
    pub async fn fetch(
        &self,
        req: &FetchRequest,
        is_allowed_host: impl Fn(&str) -> bool,
    ) -> FetchOutcome {
        let mut current = req.url.clone();
        for hop in 0..=self.max_redirects {
            let url = match Url::parse(&current) {
                Ok(u) => u,
                Err(_) => return FetchOutcome::PermanentFailure { reason: "invalid_url" },
            };
            if let Some(host) = url.host_str() {
                if !is_allowed_host(host) {
                    return FetchOutcome::RedirectOffAllowlist {
                        host: host.to_string(),
                    };
                }
            }

            let start = Instant::now();
            let mut builder = self.client.get(url.clone());
            if hop == 0 {
                if let Some(etag) = &req.if_none_match {
                    builder = builder.header(IF_NONE_MATCH, etag);
                }
                if let Some(lm) = &req.if_modified_since {
                    builder = builder.header(IF_MODIFIED_SINCE, lm);
                }
            }

            let resp = match builder.send().await {
                Ok(r) => r,
                Err(e) => return classify_transport_error(&e),
            };
            let elapsed = start.elapsed();
            let status = resp.status();

            if status.is_redirection() {
                if hop == self.max_redirects {
                    return FetchOutcome::RedirectChainExceeded;
                }
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                match location {
                    Some(loc) => match url.join(&loc) {
                        Ok(next) => {
                            current = next.to_string();
                            continue;
                        }
                        Err(_) => {
                            return FetchOutcome::PermanentFailure { reason: "invalid_redirect" }
                        }
                    },
                    None => return FetchOutcome::PermanentFailure { reason: "invalid_redirect" },
                }
            }

            if status.as_u16() == 304 {
                return FetchOutcome::NotModified {
                    status: status.as_u16(),
                    headers: header_map(resp.headers()),
                    final_url: url.to_string(),
                };
            }

            if status.as_u16() == 429 || status.is_server_error() || status.as_u16() == 408 {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                debug!(%status, elapsed_ms = elapsed.as_millis() as u64, "transient failure");
                return FetchOutcome::TransientFailure {
                    reason: transient_reason(status.as_u16()),
                    retry_after,
                };
            }

            if status.is_client_error() {
                return FetchOutcome::PermanentFailure {
                    reason: "client_error",
                };
            }

            if !status.is_success() {
                return FetchOutcome::PermanentFailure { reason: "unexpected_status" };
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.split(';').next().unwrap_or(s).trim().to_string());

            if let Some(ct) = &content_type {
                if !self.accepted_content_types.iter().any(|accepted| accepted == ct) {
                    return FetchOutcome::PermanentFailure {
                        reason: "unsupported_type",
                    };
                }
            }

            if let Some(len) = resp.content_length() {
                if len as usize > self.max_body_bytes {
                    return FetchOutcome::PermanentFailure {
                        reason: "body_too_large",
                    };
                }
            }

            let headers = header_map(resp.headers());
            let body = match resp.bytes().await {
                Ok(b) => b,
                Err(e) => return classify_transport_error(&e),
            };
            if body.len() > self.max_body_bytes {
                return FetchOutcome::PermanentFailure {
                    reason: "body_too_large",
                };
            }

            debug!(%status, bytes = body.len(), elapsed_ms = elapsed.as_millis() as u64, "fetched");
            return FetchOutcome::Fresh {
                status: status.as_u16(),
                headers,
                body: body.to_vec(),
                final_url: url.to_string(),
                content_type,
            };
        }
        FetchOutcome::RedirectChainExceeded
    }
}

fn header_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}

fn transient_reason(status: u16) -> &'static str {
    match status {
        408 => "request_timeout",
        429 => "rate_limited",
        500..=599 => "5xx",
        _ => "transient",
    }
}

fn classify_transport_error(err: &reqwest::Error) -> FetchOutcome {
    let retry_after = None;
    if err.is_timeout() {
        warn!(error = %err, "fetch timed out");
        FetchOutcome::TransientFailure {
            reason: "timeout",
            retry_after,
        }
    } else if err.is_connect() {
        warn!(error = %err, "connect failed");
        FetchOutcome::TransientFailure {
            reason: "connect",
            retry_after,
        }
    } else {
        warn!(error = %err, "request failed");
        FetchOutcome::TransientFailure {
            reason: "network",
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_reason_maps_known_statuses() {
        assert_eq!(transient_reason(503), "5xx");
        assert_eq!(transient_reason(429), "rate_limited");
        assert_eq!(transient_reason(408), "request_timeout");
    }
}
