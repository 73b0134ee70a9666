//! Multi-site scan pass.
//!
//! Runs every configured site adapter once through a scoped session,
//! collects market prices and listings, then (after every site has
//! finished) enriches the deals with profit scores, filters and ranks them.
//! One site's failure never aborts the pass: errors are classified and
//! aggregated into the pass report.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use rust_decimal::Decimal;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, SiteConfig};
use crate::engine::controller::PassRunner;
use crate::engine::report::{PassOutcome, PassReport, SiteReport, SiteStatus};
use crate::error::{ErrorKind, ScrapeError};
use crate::market::{profit, MarketPriceResolver};
use crate::pacing::RetryPolicy;
use crate::session::{ScopedSession, Session, SessionFacade};
use crate::sites::{SearchQuery, SiteAdapter};
use crate::types::Deal;

// ---------------------------------------------------------------------------
// Site entries and filtering
// ---------------------------------------------------------------------------

/// One site to scan and the query to run against it.
#[derive(Clone)]
pub struct SiteEntry {
    pub adapter: Arc<dyn SiteAdapter>,
    pub query: SearchQuery,
}

impl SiteEntry {
    pub fn new(adapter: Arc<dyn SiteAdapter>, query: SearchQuery) -> Self {
        Self { adapter, query }
    }

    pub fn from_config(adapter: Arc<dyn SiteAdapter>, cfg: &SiteConfig) -> Self {
        Self::new(
            adapter,
            SearchQuery {
                keywords: cfg.keywords.clone(),
                category: cfg.category.clone(),
            },
        )
    }
}

/// Drops deals below the discount floor or outside the brand allow-list.
#[derive(Debug, Clone, Default)]
pub struct DealFilter {
    pub min_discount: Decimal,
    /// Lowercase. Empty keeps every brand.
    pub brands: Vec<String>,
}

impl DealFilter {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            min_discount: cfg.min_discount(),
            brands: cfg.brands.iter().map(|b| b.to_lowercase()).collect(),
        }
    }

    pub fn accepts(&self, deal: &Deal) -> bool {
        if deal.discount_percent < self.min_discount {
            return false;
        }
        if self.brands.is_empty() {
            return true;
        }
        // Brand may be missing from the listing; fall back to the title.
        let haystack = deal
            .brand
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| deal.title.to_lowercase());
        self.brands.iter().any(|b| haystack.contains(b.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    sites: Vec<SiteEntry>,
    facade: Arc<SessionFacade>,
    retry: RetryPolicy,
    resolver: Arc<MarketPriceResolver>,
    filter: DealFilter,
    max_concurrent_sites: usize,
}

impl Scanner {
    pub fn new(
        sites: Vec<SiteEntry>,
        facade: Arc<SessionFacade>,
        retry: RetryPolicy,
        resolver: Arc<MarketPriceResolver>,
    ) -> Self {
        Self {
            sites,
            facade,
            retry,
            resolver,
            filter: DealFilter::default(),
            max_concurrent_sites: 1,
        }
    }

    pub fn with_filter(mut self, filter: DealFilter) -> Self {
        self.filter = filter;
        self
    }

    /// More than 1 scans sites with a bounded worker set.
    pub fn with_concurrency(mut self, max_concurrent_sites: usize) -> Self {
        self.max_concurrent_sites = max_concurrent_sites.max(1);
        self
    }

    pub fn resolver(&self) -> &Arc<MarketPriceResolver> {
        &self.resolver
    }

    pub fn site_names(&self) -> Vec<String> {
        self.sites.iter().map(|s| s.adapter.name().to_string()).collect()
    }

    /// Scan every site once and return the enriched, filtered, ranked deals.
    pub async fn scan_pass(&self, iteration: u32, run_id: &str, cancel: &CancellationToken) -> PassOutcome {
        let started_at = Utc::now();
        info!(run_id, iteration, sites = self.sites.len(), "Scan pass starting");

        let results: Vec<(SiteReport, Vec<Deal>)> = if self.max_concurrent_sites <= 1 {
            let mut out = Vec::with_capacity(self.sites.len());
            for entry in &self.sites {
                out.push(self.scan_site_guarded(entry, cancel).await);
            }
            out
        } else {
            // Every worker must finish before enrichment starts.
            let workers: Vec<BoxFuture<'_, (SiteReport, Vec<Deal>)>> = self
                .sites
                .iter()
                .map(|entry| self.scan_site_guarded(entry, cancel).boxed())
                .collect();
            stream::iter(workers)
                .buffer_unordered(self.max_concurrent_sites)
                .collect()
                .await
        };

        let mut sites = Vec::with_capacity(results.len());
        let mut raw = Vec::new();
        for (report, deals) in results {
            sites.push(report);
            raw.extend(deals);
        }
        // Keep report order stable regardless of completion order.
        let order = self.site_names();
        sites.sort_by_key(|r| order.iter().position(|n| *n == r.site).unwrap_or(usize::MAX));

        let collected = raw.len();
        let enriched = self.resolver.enrich(raw);
        let filtered: Vec<Deal> = enriched.into_iter().filter(|d| self.filter.accepts(d)).collect();
        let deals = profit::rank(filtered);
        let profitable = deals.iter().filter(|d| d.is_profitable()).count();

        let report = PassReport {
            run_id: run_id.to_string(),
            iteration,
            started_at,
            finished_at: Utc::now(),
            sites,
            deals_found: deals.len(),
            profitable,
        };
        info!(
            run_id,
            iteration,
            collected,
            kept = deals.len(),
            profitable,
            ok = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Scan pass complete"
        );

        PassOutcome { report, deals }
    }

    /// `scan_site`, with panics inside an adapter contained to that site.
    async fn scan_site_guarded(&self, entry: &SiteEntry, cancel: &CancellationToken) -> (SiteReport, Vec<Deal>) {
        let name = entry.adapter.name().to_string();
        if cancel.is_cancelled() {
            return (SiteReport::skipped(name, "shutdown requested"), Vec::new());
        }
        match AssertUnwindSafe(self.scan_site(entry)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(site = %name, "Site adapter panicked");
                let mut report = SiteReport::new(name);
                report.status = SiteStatus::Failed;
                report.error = Some("adapter panicked".to_string());
                (report, Vec::new())
            }
        }
    }

    async fn scan_site(&self, entry: &SiteEntry) -> (SiteReport, Vec<Deal>) {
        let name = entry.adapter.name();
        let started = Instant::now();
        let mut report = SiteReport::new(name);
        let mut rotated = false;

        let deals = loop {
            report.reset_counts();
            match self.scan_site_once(entry, &mut report).await {
                Ok(deals) => break deals,
                // One retry on a fresh session, which picks a different proxy.
                Err(e) if e.is_proxy_ban() && !rotated => {
                    rotated = true;
                    report.proxy_retries += 1;
                    warn!(site = name, error = %e, "Blocked, retrying with a new session");
                }
                Err(ScrapeError::NoProxy) => {
                    warn!(site = name, "No proxy available, skipping site for this pass");
                    report.status = SiteStatus::Skipped;
                    report.error = Some(ScrapeError::NoProxy.to_string());
                    break Vec::new();
                }
                Err(e) => {
                    warn!(site = name, kind = %e.kind(), error = %e, "Site failed for this pass");
                    report.status = SiteStatus::Failed;
                    report.error = Some(e.to_string());
                    break Vec::new();
                }
            }
        };

        if report.status == SiteStatus::Ok && (report.parse_skips > 0 || report.detail_failures > 0) {
            report.status = SiteStatus::Partial;
        }
        report.deals = deals.len();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(site = name, status = %report.status, deals = report.deals, "Site scan finished");
        (report, deals)
    }

    async fn scan_site_once(&self, entry: &SiteEntry, report: &mut SiteReport) -> Result<Vec<Deal>, ScrapeError> {
        let adapter = entry.adapter.as_ref();
        let session = self.facade.open(adapter.name(), adapter.prefers_browser()).await?;
        let result = self.collect(adapter, &entry.query, &session, report).await;
        session.close().await;
        result
    }

    async fn collect(
        &self,
        adapter: &dyn SiteAdapter,
        query: &SearchQuery,
        session: &ScopedSession,
        report: &mut SiteReport,
    ) -> Result<Vec<Deal>, ScrapeError> {
        let name = adapter.name();
        let session: &dyn Session = session;

        if adapter.provides_market_prices() {
            match self
                .retry
                .run("market_prices", |_| adapter.get_market_prices(session))
                .await
            {
                Ok(prices) => {
                    report.market_prices = prices.len();
                    for (fingerprint, price) in prices {
                        self.resolver.add_market_price(fingerprint, price, name);
                    }
                }
                Err(e) if e.is_proxy_ban() => return Err(e),
                Err(e) => warn!(site = name, error = %e, "Market price fetch failed"),
            }
        }

        let listings = self
            .retry
            .run("search", |_| adapter.search(session, query))
            .await?;
        report.listings = listings.len();

        let mut deals = Vec::with_capacity(listings.len());
        for listing in listings {
            if listing.is_complete() {
                if let Some(deal) = listing.into_deal(Utc::now()) {
                    deals.push(deal);
                }
                continue;
            }

            let Some(url) = listing.url.clone() else {
                debug!(site = name, title = %listing.title, "Incomplete listing without URL, skipping");
                report.parse_skips += 1;
                continue;
            };

            match self
                .retry
                .run("detail", |_| adapter.get_detail(session, &url))
                .await
            {
                Ok(deal) => deals.push(deal),
                Err(e) if e.is_proxy_ban() => return Err(e),
                Err(e) if e.kind() == ErrorKind::Parse => {
                    debug!(site = name, url = %url, error = %e, "Unparseable detail page, skipping item");
                    report.parse_skips += 1;
                }
                Err(e) => {
                    warn!(site = name, url = %url, error = %e, "Detail fetch failed, skipping item");
                    report.detail_failures += 1;
                }
            }
        }
        Ok(deals)
    }
}

#[async_trait]
impl PassRunner for Scanner {
    async fn run_pass(&self, iteration: u32, run_id: &str, cancel: &CancellationToken) -> PassOutcome {
        self.scan_pass(iteration, run_id, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
