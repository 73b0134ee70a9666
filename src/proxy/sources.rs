//! Public proxy list sources.
//!
//! Best effort: every source failure is logged and skipped.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AddReport, ProxyPool, ProxyProtocol};

const SOURCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Built-in `ip:port` list endpoints and the protocol their entries speak.
pub const FREE_SOURCES: &[(&str, ProxyProtocol)] = &[
    ("https://www.proxy-list.download/api/v1/get?type=http", ProxyProtocol::Http),
    ("https://www.proxy-list.download/api/v1/get?type=https", ProxyProtocol::Https),
    ("https://www.proxy-list.download/api/v1/get?type=socks5", ProxyProtocol::Socks5),
    (
        "https://api.proxyscrape.com/v2/?request=getproxies&protocol=http&timeout=10000",
        ProxyProtocol::Http,
    ),
    (
        "https://api.proxyscrape.com/v2/?request=getproxies&protocol=socks5&timeout=10000",
        ProxyProtocol::Socks5,
    ),
    (
        "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt",
        ProxyProtocol::Http,
    ),
    (
        "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks5.txt",
        ProxyProtocol::Socks5,
    ),
];

/// Turn a plain `ip:port` body into scheme-qualified specs.
pub fn specs_from_body(body: &str, protocol: ProxyProtocol) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| {
            if l.contains("://") {
                l.to_string()
            } else {
                format!("{}://{l}", protocol.scheme())
            }
        })
        .collect()
}

impl ProxyPool {
    /// Populate the pool from the built-in public sources.
    pub async fn fetch_free(&self) -> AddReport {
        let client = match reqwest::Client::builder().timeout(SOURCE_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Could not build HTTP client for proxy sources");
                return AddReport::default();
            }
        };
        self.fetch_from(&client, FREE_SOURCES).await
    }

    pub async fn fetch_from(
        &self,
        client: &reqwest::Client,
        sources: &[(&str, ProxyProtocol)],
    ) -> AddReport {
        let mut total = AddReport::default();
        for (url, protocol) in sources {
            let body = match fetch_body(client, url).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(source = url, error = %e, "Proxy source failed");
                    continue;
                }
            };
            let report = self.add(specs_from_body(&body, *protocol));
            debug!(
                source = url,
                added = report.added,
                duplicates = report.duplicates,
                invalid = report.invalid,
                "Proxy source fetched"
            );
            total.added += report.added;
            total.duplicates += report.duplicates;
            total.invalid += report.invalid;
        }
        info!(
            added = total.added,
            duplicates = total.duplicates,
            pool_size = self.len(),
            "Free proxy fetch complete"
        );
        total
    }
}

async fn fetch_body(client: &reqwest::Client, url: &str) -> Result<String, reqwest::Error> {
    client.get(url).send().await?.error_for_status()?.text().await
}
