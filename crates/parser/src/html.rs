use std::collections::HashMap;

use scraper::{Html, Selector};
use url::Url;

use crawld_core::ExtractedLink;

const EXCLUDED_TAGS: &[&str] = &["nav", "footer", "script", "style", "header", "aside", "noscript"];

pub struct HtmlResult {
    pub title: Option<String>,
    pub main_text: String,
    pub canonical_href: Option<String>,
    pub links: Vec<ExtractedLink>,
    pub meta_description: Option<String>,
    pub meta_keywords: Vec<String>,
    pub language: Option<String>,
    pub open_graph: HashMap<String, String>,
}

pub fn parse_html(html_str: &str, base_url: &Url) -> HtmlResult {
    let document = Html::parse_document(html_str);
    let base_host = base_url.host_str().unwrap_or("");

    let title = selector("title")
        .and_then(|s| document.select(&s).next())
        .map(|el| el.text().collect::<String>().trim().to_string());

    let main_text = collapse_whitespace(&extract_main_text(&document));

    let canonical_href = selector("link[rel='canonical']")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("href").map(|s| s.to_string()));

    let links = extract_links(&document, base_url, base_host);

    let meta_description = extract_meta_content(&document, "description");
    let meta_keywords = extract_meta_content(&document, "keywords")
        .map(|k| k.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let language = selector("html")
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("lang").map(|s| s.to_string()));

    let mut open_graph = HashMap::new();
    if let Some(sel) = selector("meta[property^='og:']") {
        for el in document.select(&sel) {
            if let (Some(prop), Some(content)) =
                (el.value().attr("property"), el.value().attr("content"))
            {
                open_graph.insert(prop.to_string(), content.to_string());
            }
        }
    }

    HtmlResult {
        title,
        main_text,
        canonical_href,
        links,
        meta_description,
        meta_keywords,
        language,
        open_graph,
    }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

/// Prefers semantic main regions; falls back to `body`. Boilerplate
/// (nav/footer/script/style/header/aside) is stripped by skipping any text
/// node whose ancestor chain includes one of those tags.
fn extract_main_text(document: &Html) -> String {
    let container = selector("main")
        .and_then(|s| document.select(&s).next())
        .or_else(|| {
            selector("article").and_then(|s| document.select(&s).next())
        })
        .or_else(|| {
            selector("[role='main']").and_then(|s| document.select(&s).next())
        })
        .or_else(|| selector("body").and_then(|s| document.select(&s).next()));

    let Some(el) = container else {
        return String::new();
    };

    let mut buf = String::new();
    for node in el.descendants() {
        if let Some(text) = node.value().as_text() {
            let excluded = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| EXCLUDED_TAGS.contains(&e.name()))
                    .unwrap_or(false)
            });
            if !excluded {
                buf.push_str(text);
                buf.push(' ');
            }
        }
    }
    buf
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_links(document: &Html, base_url: &Url, base_host: &str) -> Vec<ExtractedLink> {
    let Some(sel) = selector("a[href]") else {
        return vec![];
    };

    document
        .select(&sel)
        .filter_map(|el| {
            let href = el.value().attr("href")?;
            let trimmed = href.trim();

            if trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with("javascript:")
                || trimmed.starts_with("mailto:")
                || trimmed.starts_with("tel:")
                || trimmed.starts_with("data:")
            {
                return None;
            }

            let resolved = base_url.join(trimmed).ok()?;
            let host = resolved.host_str().unwrap_or("");

            let anchor_text = {
                let t = el.text().collect::<String>().trim().to_string();
                if t.is_empty() {
                    None
                } else {
                    Some(t)
                }
            };

            Some(ExtractedLink {
                url: resolved.to_string(),
                anchor_text,
                is_external: host != base_host,
            })
        })
        .collect()
}

fn extract_meta_content(document: &Html, name: &str) -> Option<String> {
    let sel_str = format!(
        "meta[name='{}'], meta[name='{}']",
        name,
        name.to_uppercase()
    );
    selector(&sel_str)
        .and_then(|s| document.select(&s).next())
        .and_then(|el| el.value().attr("content").map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_nav_and_footer_from_main_text() {
        let html = r#"<html><body>
            <nav>Home About</nav>
            <main><p>The quick brown fox.</p></main>
            <footer>Copyright 2026</footer>
        </body></html>"#;
        let base = Url::parse("https://example.test/").unwrap();
        let result = parse_html(html, &base);
        assert!(result.main_text.contains("quick brown fox"));
        assert!(!result.main_text.contains("Copyright"));
        assert!(!result.main_text.contains("Home About"));
    }

    #[test]
    fn extracts_canonical_and_links() {
        let html = r#"<html><head><link rel="canonical" href="https://example.test/canon"></head>
            <body><main><a href="/a">A</a><a href="https://other.test/x">X</a></main></body></html>"#;
        let base = Url::parse("https://example.test/page").unwrap();
        let result = parse_html(html, &base);
        assert_eq!(result.canonical_href.as_deref(), Some("https://example.test/canon"));
        assert_eq!(result.links.len(), 2);
        assert!(!result.links[0].is_external);
        assert!(result.links[1].is_external);
    }
}
