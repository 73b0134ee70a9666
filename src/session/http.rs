//! Plain HTTP session, the last link of the engine fallback chain.
//!
//! Sends browser-like headers, a Google-search referer and a cache-busting
//! query parameter so repeated fetches of one listing are not served a stale
//! or fingerprinted cached copy.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{EngineKind, FetchedPage, Session, SessionBackend, SessionSpec};
use crate::error::ScrapeError;

const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,application/json;q=0.9,*/*;q=0.8";

pub struct HttpBackend;

#[async_trait]
impl SessionBackend for HttpBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Http
    }

    async fn launch(&self, spec: &SessionSpec) -> Result<Box<dyn Session>, ScrapeError> {
        let init_err = |reason: String| ScrapeError::SessionInit {
            engine: EngineKind::Http.to_string(),
            reason,
        };

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&spec.fingerprint.accept_language)
                .map_err(|e| init_err(e.to_string()))?,
        );
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let mut builder = reqwest::Client::builder()
            .timeout(spec.timeout)
            .default_headers(headers)
            .user_agent(spec.fingerprint.user_agent.clone());
        if let Some(lease) = &spec.proxy {
            let proxy = reqwest::Proxy::all(lease.url()).map_err(|e| init_err(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| init_err(e.to_string()))?;

        debug!(site = %spec.site, user_agent = %spec.fingerprint.user_agent, "HTTP session ready");
        Ok(Box::new(HttpSession {
            client,
            timeout: spec.timeout,
        }))
    }
}

pub struct HttpSession {
    client: reqwest::Client,
    timeout: Duration,
}

#[async_trait]
impl Session for HttpSession {
    fn engine(&self) -> EngineKind {
        EngineKind::Http
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let target = cache_busted(url)?;
        let mut request = self.client.get(target.as_str());
        if let Some(referer) = google_referer(&target) {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ScrapeError::Timeout(self.timeout)
            } else {
                ScrapeError::from(e)
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(ScrapeError::from_status(status, url));
        }
        let body = response.text().await?;

        Ok(FetchedPage {
            url: url.to_string(),
            status,
            body,
            engine: EngineKind::Http,
        })
    }

    async fn close(&self) {}
}

/// Append `_nocache=<millis>` to the query string.
pub fn cache_busted(url: &str) -> Result<Url, ScrapeError> {
    let mut parsed =
        Url::parse(url).map_err(|e| ScrapeError::Permanent(format!("invalid URL {url:?}: {e}")))?;
    let stamp = chrono::Utc::now().timestamp_millis().to_string();
    parsed.query_pairs_mut().append_pair("_nocache", &stamp);
    Ok(parsed)
}

fn google_referer(url: &Url) -> Option<String> {
    url.host_str()
        .map(|host| format!("https://www.google.com/search?q={}", urlencoding::encode(host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BrowserFingerprint;

    #[test]
    fn test_cache_busting_keeps_query() {
        let url = cache_busted("https://outlet.example.com/search?q=dunk").unwrap();
        let pairs: Vec<_> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        assert_eq!(pairs, vec!["q", "_nocache"]);
    }

    #[test]
    fn test_invalid_url_is_permanent() {
        let err = cache_busted("not a url").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Permanent);
    }

    #[test]
    fn test_referer_uses_host() {
        let url = Url::parse("https://shop.example.com/p/1").unwrap();
        assert_eq!(
            google_referer(&url).unwrap(),
            "https://www.google.com/search?q=shop.example.com"
        );
    }

    #[tokio::test]
    async fn test_launch_with_proxy() {
        let pool = crate::proxy::ProxyPool::new(crate::proxy::PoolSettings::default());
        pool.add(["socks5://user:pw@127.0.0.1:1080"]);
        let spec = SessionSpec {
            site: "outlet".into(),
            fingerprint: BrowserFingerprint::randomized(),
            proxy: pool.acquire(crate::proxy::RotationStrategy::RoundRobin),
            timeout: Duration::from_secs(5),
        };
        let session = HttpBackend.launch(&spec).await.unwrap();
        assert_eq!(session.engine(), EngineKind::Http);
        session.close().await;
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let spec = SessionSpec {
            site: "local".into(),
            fingerprint: BrowserFingerprint::fixed(1280, 720),
            proxy: None,
            timeout: Duration::from_millis(500),
        };
        let session = HttpBackend.launch(&spec).await.unwrap();
        let err = session.fetch("http://127.0.0.1:9/feed").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
