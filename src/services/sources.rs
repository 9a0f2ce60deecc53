//! Candidate source loading
//!
//! A sources file mixes inline candidates with remote list URLs. Remote lists
//! are fetched directly (never through a candidate) and scanned the same way.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::SourceConfig;
use crate::error::{Result, ScanError};
use crate::models::{Endpoint, ProtocolHint, MIN_CANDIDATE_LEN};
use crate::proxy::dial::tls_connector;
use crate::proxy::transport::{Dialer, HttpResponse, TunnelDialer};

/// Remote lists fetched at once
const FETCH_CONCURRENCY: usize = 16;

/// Redirect hops followed per remote list
const MAX_REDIRECTS: usize = 5;

/// Largest remote list body accepted
pub const MAX_SOURCE_BODY: usize = 16 * 1024 * 1024;

/// One line of the sources file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLine {
    /// URL of a remote candidate list
    Remote(Url),
    /// Text scanned for candidates in place
    Inline(String),
}

impl SourceLine {
    /// Classify a sources-file line; comments and short lines yield `None`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.len() < MIN_CANDIDATE_LEN || line.starts_with('#') {
            return None;
        }

        if let Ok(url) = Url::parse(line) {
            if is_remote_list(&url) {
                return Some(SourceLine::Remote(url));
            }
        }
        Some(SourceLine::Inline(line.to_string()))
    }
}

/// An http(s) URL that points at a document rather than at a proxy
fn is_remote_list(url: &Url) -> bool {
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return false;
    }
    let has_path = !matches!(url.path(), "" | "/");
    has_path || url.query().is_some() || url.port().is_none()
}

/// Hint a whole line lends to the bare tokens on it
fn line_hint(line: &str) -> ProtocolHint {
    let lower = line.to_ascii_lowercase();
    if lower.contains("socks5://") || lower.contains("socks5h://") {
        ProtocolHint::Socks5
    } else if lower.contains("http://") || lower.contains("https://") {
        ProtocolHint::Http
    } else {
        ProtocolHint::Unknown
    }
}

/// Pull every normalizable endpoint out of free text
///
/// Order is preserved; duplicates within the text are not removed here.
pub fn extract_candidates(text: &str) -> Vec<Endpoint> {
    let mut found = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let hint = line_hint(line);
        let tokens = line
            .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '|' | '"' | '\''))
            .filter(|t| t.len() >= MIN_CANDIDATE_LEN);

        for token in tokens {
            let endpoints = match Endpoint::normalize(token) {
                Some(endpoint) => vec![endpoint],
                None => embedded_ipv4_endpoints(token),
            };

            for endpoint in endpoints {
                if endpoint.hint() == ProtocolHint::Unknown && hint != ProtocolHint::Unknown {
                    found.push(endpoint.with_hint(hint));
                } else {
                    found.push(endpoint);
                }
            }
        }
    }

    found
}

/// Find `a.b.c.d:port` spans inside a token that is not a candidate by itself
///
/// Covers `ip:port:country`, `ip:port:user:pass` and markup such as
/// `<td>ip:port</td>`.
fn embedded_ipv4_endpoints(token: &str) -> Vec<Endpoint> {
    let mut found = Vec::new();

    for span in token.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == ':')) {
        let parts: Vec<&str> = span.split(':').collect();
        for pair in parts.windows(2) {
            let (host, port) = (pair[0], pair[1]);
            if host.parse::<Ipv4Addr>().is_err() {
                continue;
            }
            if port.is_empty() || port.len() > 5 {
                continue;
            }
            if let Ok(port) = port.parse::<u16>() {
                if let Ok(endpoint) = Endpoint::new(host, port, ProtocolHint::Unknown) {
                    found.push(endpoint);
                }
            }
        }
    }

    found
}

/// Loads and deduplicates candidates from a sources file
pub struct SourceLoader {
    fetcher: Arc<dyn Dialer>,
    timeout: Duration,
}

impl SourceLoader {
    pub fn new(fetcher: Arc<dyn Dialer>, timeout: Duration) -> Self {
        Self { fetcher, timeout }
    }

    /// Loader fetching remote lists over direct connections
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let dialer = TunnelDialer::direct(tls_connector()?).with_body_limit(MAX_SOURCE_BODY);
        Ok(Self::new(Arc::new(dialer), config.fetch_timeout))
    }

    /// Read the sources file and load every entry
    pub async fn load_file(&self, path: &Path) -> Result<Vec<Endpoint>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), "Cannot read sources file: {}", e);
                return Err(ScanError::NothingToDo);
            }
        };
        self.load_lines(text.lines()).await
    }

    /// Load candidates from sources-file lines
    ///
    /// Unreachable lists are skipped. Zero candidates overall is `NothingToDo`.
    #[instrument(skip(self, lines))]
    pub async fn load_lines<'a>(
        &self,
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<Endpoint>> {
        let mut remote = Vec::new();
        let mut inline = String::new();

        for line in lines.into_iter().filter_map(SourceLine::parse) {
            match line {
                SourceLine::Remote(url) => remote.push(url),
                SourceLine::Inline(text) => {
                    inline.push_str(&text);
                    inline.push('\n');
                }
            }
        }

        info!("Sources: {} remote lists", remote.len());

        let mut candidates = extract_candidates(&inline);

        let fetched: Vec<Vec<Endpoint>> = stream::iter(remote)
            .map(|url| async move { self.fetch(&url).await })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;
        candidates.extend(fetched.into_iter().flatten());

        let unique = dedupe(candidates);
        if unique.is_empty() {
            return Err(ScanError::NothingToDo);
        }

        info!("Loaded {} unique candidates", unique.len());
        Ok(unique)
    }

    /// Fetch one list, following redirects; the timeout covers every hop
    async fn fetch(&self, url: &Url) -> Vec<Endpoint> {
        let response = match timeout(self.timeout, self.follow(url)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(source = %url, "Source fetch failed: {}", e);
                return Vec::new();
            }
            Err(_) => {
                warn!(source = %url, "Source fetch timed out");
                return Vec::new();
            }
        };

        if !(200..300).contains(&response.status) {
            warn!(source = %url, status = response.status, "Source returned non-success status");
            return Vec::new();
        }

        let found = extract_candidates(&response.body_text());
        debug!(source = %url, count = found.len(), "Source fetched");
        found
    }

    async fn follow(&self, url: &Url) -> Result<HttpResponse> {
        let mut current = url.clone();

        for _ in 0..=MAX_REDIRECTS {
            let response = self.fetcher.get(&current).await?;
            if !response.is_redirect() {
                return Ok(response);
            }

            let location = response.location.as_deref().unwrap_or_default();
            let next = current.join(location).map_err(|e| {
                ScanError::Http(format!("bad redirect target '{}': {}", location, e))
            })?;
            debug!(from = %current, to = %next, "Following redirect");
            current = next;
        }

        Err(ScanError::Http(format!("more than {} redirects", MAX_REDIRECTS)))
    }
}

/// Keep the first occurrence of every identity
fn dedupe(candidates: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|e| seen.insert(e.identity()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use async_trait::async_trait;
    use bytes::Bytes;

    struct StaticFetcher {
        pages: HashMap<String, (u16, &'static str)>,
    }

    #[async_trait]
    impl Dialer for StaticFetcher {
        async fn get(&self, url: &Url) -> Result<HttpResponse> {
            match self.pages.get(url.as_str()) {
                Some((status, body)) if body.starts_with("->") => {
                    let mut response = HttpResponse::new(*status, Bytes::new());
                    response.location = Some(body.trim_start_matches("->").to_string());
                    Ok(response)
                }
                Some((status, body)) => {
                    Ok(HttpResponse::new(*status, Bytes::from_static(body.as_bytes())))
                }
                None => Err(ScanError::TunnelError("connection refused".to_string())),
            }
        }

        fn release(&self) {}
    }

    fn loader(pages: &[(&str, u16, &'static str)]) -> SourceLoader {
        let pages = pages
            .iter()
            .map(|(url, status, body)| (url.to_string(), (*status, *body)))
            .collect();
        SourceLoader::new(Arc::new(StaticFetcher { pages }), Duration::from_secs(1))
    }

    #[test]
    fn test_source_line_classification() {
        assert_eq!(SourceLine::parse("# comment"), None);
        assert_eq!(SourceLine::parse("  "), None);
        assert!(matches!(
            SourceLine::parse("https://lists.example/http.txt"),
            Some(SourceLine::Remote(_))
        ));
        assert!(matches!(
            SourceLine::parse("https://lists.example"),
            Some(SourceLine::Remote(_))
        ));
        assert_eq!(
            SourceLine::parse("http://1.2.3.4:8080"),
            Some(SourceLine::Inline("http://1.2.3.4:8080".to_string()))
        );
        assert_eq!(
            SourceLine::parse("5.6.7.8:1080"),
            Some(SourceLine::Inline("5.6.7.8:1080".to_string()))
        );
    }

    #[test]
    fn test_extract_candidates_with_line_hints() {
        let text = "\
1.1.1.1:80 US elite
socks5://2.2.2.2:1080
proxy list: 3.3.3.3:3128, 4.4.4.4:8080 (http://)
garbage line
# 5.5.5.5:80
";
        let found = extract_candidates(text);
        let described: Vec<(String, ProtocolHint)> =
            found.iter().map(|e| (e.identity(), e.hint())).collect();

        assert_eq!(
            described,
            vec![
                ("1.1.1.1:80".to_string(), ProtocolHint::Unknown),
                ("2.2.2.2:1080".to_string(), ProtocolHint::Socks5),
                ("3.3.3.3:3128".to_string(), ProtocolHint::Http),
                ("4.4.4.4:8080".to_string(), ProtocolHint::Http),
            ]
        );
    }

    #[tokio::test]
    async fn test_load_lines_merges_and_dedupes() {
        let loader = loader(&[
            ("https://lists.example/a.txt", 200, "1.1.1.1:80\n2.2.2.2:8080\n"),
            ("https://lists.example/b.txt", 200, "2.2.2.2:8080\n3.3.3.3:1080 socks5://\n"),
            ("https://lists.example/gone.txt", 404, "not found"),
        ]);

        let endpoints = loader
            .load_lines([
                "# my sources",
                "9.9.9.9:3128",
                "https://lists.example/a.txt",
                "https://lists.example/b.txt",
                "https://lists.example/gone.txt",
                "https://lists.example/unreachable.txt",
            ])
            .await
            .unwrap();

        let identities: Vec<String> = endpoints.iter().map(Endpoint::identity).collect();
        assert_eq!(
            identities,
            vec!["9.9.9.9:3128", "1.1.1.1:80", "2.2.2.2:8080", "3.3.3.3:1080"]
        );
        assert_eq!(endpoints[3].hint(), ProtocolHint::Socks5);
    }

    #[tokio::test]
    async fn test_no_candidates_is_nothing_to_do() {
        let loader = loader(&[("https://lists.example/empty.txt", 200, "nothing here\n")]);

        let err = tokio_test::assert_err!(
            loader
                .load_lines(["https://lists.example/empty.txt", "# only comments"])
                .await
        );
        assert!(matches!(err, ScanError::NothingToDo));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_extract_candidates_from_decorated_formats() {
        let text = "\
1.2.3.4:8080:US
<td>5.6.7.8:3128</td>
9.9.9.9:1080:user:pass
<tr><td>socks5://</td><td>7.7.7.7:1081</td></tr>
999.1.1.1:80:XX
";
        let found = extract_candidates(text);
        let described: Vec<(String, ProtocolHint)> =
            found.iter().map(|e| (e.identity(), e.hint())).collect();

        assert_eq!(
            described,
            vec![
                ("1.2.3.4:8080".to_string(), ProtocolHint::Unknown),
                ("5.6.7.8:3128".to_string(), ProtocolHint::Unknown),
                ("9.9.9.9:1080".to_string(), ProtocolHint::Unknown),
                ("7.7.7.7:1081".to_string(), ProtocolHint::Socks5),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_follows_redirects() {
        let loader = loader(&[
            ("https://lists.example/old.txt", 301, "->/new.txt"),
            ("https://lists.example/new.txt", 302, "->https://mirror.example/list.txt"),
            ("https://mirror.example/list.txt", 200, "1.1.1.1:80\n"),
        ]);

        let endpoints = loader
            .load_lines(["https://lists.example/old.txt"])
            .await
            .unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].identity(), "1.1.1.1:80");
    }

    #[tokio::test]
    async fn test_redirect_loop_is_skipped() {
        let loader = loader(&[
            ("https://lists.example/a.txt", 302, "->/b.txt"),
            ("https://lists.example/b.txt", 302, "->/a.txt"),
        ]);

        let loaded = loader
            .load_lines(["https://lists.example/a.txt", "2.2.2.2:8080"])
            .await
            .map(|found| found.iter().map(Endpoint::identity).collect::<Vec<_>>());
        assert_eq!(tokio_test::assert_ok!(loaded), vec!["2.2.2.2:8080"]);
    }

    #[tokio::test]
    async fn test_missing_sources_file() {
        let loader = loader(&[]);
        let err = loader
            .load_file(Path::new("/nonexistent/relay-validator/sources.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NothingToDo));
    }
}
