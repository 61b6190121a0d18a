pub mod html;

use sha2::{Digest, Sha256};
use url::Url;

use crawld_core::{CrawlError, ExtractedLink, PageMetadata, ParsedPage};

/// Pages below this many characters of main text are treated as empty.
const MIN_MAIN_TEXT_LEN: usize = 20;

/// Max bytes to parse (5 MB). Larger bodies are truncated before parsing.
const MAX_PARSE_SIZE: usize = 5 * 1024 * 1024;

/// Parses a fetched HTML body into a [`ParsedPage`].
///
/// `final_url` is the URL the fetch actually resolved to after redirects;
/// canonicalization prefers a same-host `<link rel="canonical">` over it,
/// per the revisit/identity rules in the queue store. Content hash is taken
/// over the normalized main text rather than the raw HTML, so that
/// whitespace-only or markup-only churn does not look like a content change
/// to the revisit policy.
pub fn parse(body: &[u8], final_url: &str) -> Result<ParsedPage, CrawlError> {
    let truncated = if body.len() > MAX_PARSE_SIZE {
        &body[..MAX_PARSE_SIZE]
    } else {
        body
    };
    let body_str = String::from_utf8_lossy(truncated);

    let base_url = Url::parse(final_url).map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;
    let html_result = html::parse_html(&body_str, &base_url);

    if html_result.main_text.trim().len() < MIN_MAIN_TEXT_LEN {
        return Err(CrawlError::ParseEmpty);
    }

    let canonical_url = canonicalize(&html_result.canonical_href, &base_url);

    let mut hasher = Sha256::new();
    hasher.update(html_result.main_text.as_bytes());
    let content_hash = format!("{:x}", hasher.finalize());

    let links: Vec<ExtractedLink> = html_result.links;

    let metadata = PageMetadata {
        meta_description: html_result.meta_description,
        meta_keywords: html_result.meta_keywords,
        language: html_result.language,
        open_graph: html_result.open_graph,
    };

    Ok(ParsedPage {
        title: html_result.title,
        main_text: html_result.main_text,
        content_hash,
        canonical_url,
        links,
        metadata,
    })
}

/// Resolves the canonical URL: a same-host `<link rel="canonical">` wins,
/// otherwise the final (post-redirect) URL is used, with the fragment
/// stripped and host lowercased.
fn canonicalize(canonical_href: &Option<String>, base_url: &Url) -> String {
    let base_host = base_url.host_str().unwrap_or("").to_lowercase();

    if let Some(href) = canonical_href {
        if let Ok(mut candidate) = base_url.join(href) {
            candidate.set_fragment(None);
            let candidate_host = candidate.host_str().unwrap_or("").to_lowercase();
            if candidate_host == base_host {
                return candidate.to_string();
            }
        }
    }

    let mut fallback = base_url.clone();
    fallback.set_fragment(None);
    fallback.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_body_is_parse_empty_error() {
        let html = b"<html><body><nav>menu</nav></body></html>";
        let err = parse(html, "https://example.test/").unwrap_err();
        assert!(matches!(err, CrawlError::ParseEmpty));
    }

    #[test]
    fn content_hash_stable_across_whitespace_changes() {
        let a = b"<html><body><main>Hello   world, this is a test page.</main></body></html>";
        let b = b"<html><body><main>Hello world, this is a test page.</main></body></html>";
        let pa = parse(a, "https://example.test/").unwrap();
        let pb = parse(b, "https://example.test/").unwrap();
        assert_eq!(pa.content_hash, pb.content_hash);
    }

    #[test]
    fn canonical_same_host_preferred_over_final_url() {
        let html = br#"<html><head><link rel="canonical" href="https://example.test/clean"></head>
            <body><main>Some reasonably long body text for the page here.</main></body></html>"#;
        let page = parse(html, "https://example.test/page?utm=1").unwrap();
        assert_eq!(page.canonical_url, "https://example.test/clean");
    }

    #[test]
    fn canonical_cross_host_ignored_falls_back_to_final_url() {
        let html = br#"<html><head><link rel="canonical" href="https://other.test/clean"></head>
            <body><main>Some reasonably long body text for the page here.</main></body></html>"#;
        let page = parse(html, "https://example.test/page").unwrap();
        assert_eq!(page.canonical_url, "https://example.test/page");
    }
}
