//! Web search and page fetching for the knowledge harvester.
//!
//! Two search engines with fallback (DuckDuckGo HTML, then Bing CN result
//! scraping) and two fetch strategies with fallback (the r.jina.ai reader
//! proxy, then direct HTTP plus local text extraction).

use std::time::Duration;

use scraper::{Html, Selector};
use tracing::{debug, info, warn};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const READER_TIMEOUT: Duration = Duration::from_secs(30);
const DIRECT_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Minimum usable content length per fetched page.
const MIN_CONTENT_CHARS: usize = 50;
/// Reader-proxy output shorter than this is treated as blocked/empty.
const MIN_READER_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub href: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub title: String,
    pub url: String,
    pub domain: String,
    pub content: String,
}

pub struct Crawler {
    client: reqwest::Client,
}

impl Default for Crawler {
    fn default() -> Self {
        Self::new()
    }
}

impl Crawler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Ranked search + fetch: engine A with engine-B fallback, white/black
    /// list ranking, then per-URL polite fetching.
    pub async fn search_and_fetch(
        &self,
        keyword: &str,
        whitelist: &[String],
        blacklist: &[String],
        max_results: usize,
    ) -> Vec<FetchedPage> {
        let mut hits = self.search_ddg(keyword, max_results).await;
        if hits.is_empty() {
            hits = self.search_bing(keyword, max_results).await;
        }
        if hits.is_empty() {
            warn!(keyword, "all search engines failed");
            return Vec::new();
        }

        let targets = rank_hits(hits, whitelist, blacklist, max_results);
        info!(
            keyword,
            targets = ?targets.iter().map(|t| truncate_chars(&t.title, 10)).collect::<Vec<_>>(),
            "fetch targets selected"
        );

        let mut pages = Vec::new();
        for hit in targets {
            // polite delay between page fetches
            let delay_ms = 1000 + (rand::random::<u64>() % 2000);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            let (content, strategy) = match self.fetch_via_reader(&hit.href).await {
                Some(text) => (Some(text), "reader-proxy"),
                None => (self.fetch_direct(&hit.href).await, "direct"),
            };

            match content {
                Some(content) if content.chars().count() > MIN_CONTENT_CHARS => {
                    info!(
                        strategy,
                        title = %truncate_chars(&hit.title, 15),
                        chars = content.chars().count(),
                        "page fetched"
                    );
                    pages.push(FetchedPage {
                        domain: domain_of(&hit.href),
                        title: hit.title,
                        url: hit.href,
                        content,
                    });
                }
                _ => warn!(url = %hit.href, "content empty, page skipped"),
            }
        }
        pages
    }

    /// Engine A: DuckDuckGo HTML endpoint.
    async fn search_ddg(&self, keyword: &str, max_results: usize) -> Vec<SearchHit> {
        debug!(keyword, "searching via DuckDuckGo");
        let resp = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", keyword)])
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => parse_ddg_results(&body, max_results + 2),
                Err(e) => {
                    warn!(err = %e, "DuckDuckGo body read failed");
                    Vec::new()
                }
            },
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "DuckDuckGo search failed");
                Vec::new()
            }
            Err(e) => {
                warn!(err = %e, "DuckDuckGo unreachable");
                Vec::new()
            }
        }
    }

    /// Engine B: Bing CN result-page scraping.
    async fn search_bing(&self, keyword: &str, max_results: usize) -> Vec<SearchHit> {
        info!(keyword, "falling back to Bing CN");
        let resp = self
            .client
            .get("https://cn.bing.com/search")
            .query(&[("q", keyword)])
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => parse_bing_results(&body, max_results + 2),
                Err(e) => {
                    warn!(err = %e, "Bing body read failed");
                    Vec::new()
                }
            },
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "Bing search failed");
                Vec::new()
            }
            Err(e) => {
                warn!(err = %e, "Bing unreachable");
                Vec::new()
            }
        }
    }

    /// Strategy A: reader proxy returning markdown. Handles anti-bot pages.
    async fn fetch_via_reader(&self, url: &str) -> Option<String> {
        let resp = self
            .client
            .get(format!("https://r.jina.ai/{url}"))
            .timeout(READER_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let text = resp.text().await.ok()?;
        if text.chars().count() > MIN_READER_CHARS && !text.contains("Cloudflare") {
            Some(text)
        } else {
            None
        }
    }

    /// Strategy B: direct HTTP plus local readability extraction.
    async fn fetch_direct(&self, url: &str) -> Option<String> {
        let resp = self
            .client
            .get(url)
            .timeout(DIRECT_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body = resp.text().await.ok()?;
        let text = extract_readable_text(&body);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Blacklisted domains drop out, whitelisted score 100, the rest 50;
/// stable sort keeps engine order within a tier; top `max_results` survive.
pub fn rank_hits(
    hits: Vec<SearchHit>,
    whitelist: &[String],
    blacklist: &[String],
    max_results: usize,
) -> Vec<SearchHit> {
    let mut candidates: Vec<(u32, SearchHit)> = hits
        .into_iter()
        .filter_map(|hit| {
            let domain = domain_of(&hit.href);
            if blacklist.iter().any(|b| domain.contains(b.as_str())) {
                return None;
            }
            let score = if whitelist.iter().any(|w| domain.contains(w.as_str())) {
                100
            } else {
                50
            };
            Some((score, hit))
        })
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.truncate(max_results);
    candidates.into_iter().map(|(_, hit)| hit).collect()
}

pub fn domain_of(url: &str) -> String {
    url.split('/').nth(2).unwrap_or("").to_string()
}

/// Char-safe prefix truncation (URLs and titles are routinely non-ASCII).
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn parse_ddg_results(body: &str, limit: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(body);
    let selector = match Selector::parse("a.result__a") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    doc.select(&selector)
        .filter_map(|a| {
            let href = a.value().attr("href")?.to_string();
            let title = a.text().collect::<String>().trim().to_string();
            if href.is_empty() || title.is_empty() {
                None
            } else {
                Some(SearchHit { href, title })
            }
        })
        .take(limit)
        .collect()
}

fn parse_bing_results(body: &str, limit: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(body);
    let selector = match Selector::parse("li.b_algo > h2 > a") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    doc.select(&selector)
        .filter_map(|a| {
            let href = a.value().attr("href")?.to_string();
            let title = a.text().collect::<String>().trim().to_string();
            if href.is_empty() || title.is_empty() {
                None
            } else {
                Some(SearchHit { href, title })
            }
        })
        .take(limit)
        .collect()
}

/// Crude readability pass: body text of content-bearing elements, scripts
/// and styles excluded by construction.
fn extract_readable_text(body: &str) -> String {
    let doc = Html::parse_document(body);
    let selector = match Selector::parse("p, h1, h2, h3, li, td") {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    let mut out = String::new();
    for element in doc.select(&selector) {
        let text = element.text().collect::<String>();
        let text = text.trim();
        if !text.is_empty() {
            out.push_str(text);
            out.push('\n');
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_boosts_whitelist_and_drops_blacklist() {
        let hits = vec![
            SearchHit {
                href: "https://spam.example.com/page".into(),
                title: "spam".into(),
            },
            SearchHit {
                href: "https://blog.example.org/post".into(),
                title: "blog".into(),
            },
            SearchHit {
                href: "https://en.wikipedia.org/wiki/Tavern".into(),
                title: "wiki".into(),
            },
        ];
        let ranked = rank_hits(
            hits,
            &["wikipedia.org".to_string()],
            &["spam.example.com".to_string()],
            6,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].title, "wiki");
        assert_eq!(ranked[1].title, "blog");
    }

    #[test]
    fn ranking_is_stable_within_a_tier() {
        let hits: Vec<SearchHit> = (0..4)
            .map(|i| SearchHit {
                href: format!("https://site{i}.com/a"),
                title: format!("t{i}"),
            })
            .collect();
        let ranked = rank_hits(hits, &[], &[], 3);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].title, "t0");
        assert_eq!(ranked[2].title, "t2");
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_of("https://en.wikipedia.org/wiki/X"), "en.wikipedia.org");
        assert_eq!(domain_of("no-scheme"), "");
    }

    #[test]
    fn char_truncation_is_utf8_safe() {
        assert_eq!(truncate_chars("酒馆深处的秘密", 2), "酒馆");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }

    #[test]
    fn bing_result_page_parses() {
        let html = r#"
            <html><body><ol id="b_results">
              <li class="b_algo"><h2><a href="https://one.example.com/a">First hit</a></h2></li>
              <li class="b_algo"><h2><a href="https://two.example.com/b">Second hit</a></h2></li>
              <li class="b_ad"><h2><a href="https://ads.example.com">Ad</a></h2></li>
            </ol></body></html>"#;
        let hits = parse_bing_results(html, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].href, "https://one.example.com/a");
        assert_eq!(hits[1].title, "Second hit");
    }

    #[test]
    fn ddg_result_page_parses() {
        let html = r#"
            <html><body>
              <a class="result__a" href="https://one.example.com/a">First</a>
              <a class="other" href="https://nope.example.com">Nope</a>
            </body></html>"#;
        let hits = parse_ddg_results(html, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "First");
    }

    #[test]
    fn readable_text_skips_markup() {
        let html = r#"
            <html><head><script>var x = 1;</script><style>p{}</style></head>
            <body><h1>Title</h1><p>Body text.</p><div>ignored</div></body></html>"#;
        let text = extract_readable_text(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Body text."));
        assert!(!text.contains("var x"));
        assert!(!text.contains("ignored"));
    }
}
