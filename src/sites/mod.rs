//! Site adapters.
//!
//! Defines the `SiteAdapter` capability trait consumed by the scanner and
//! provides a generic JSON-feed adapter driven by configuration. Adapters
//! never open sessions themselves: the scanner hands them a scoped session
//! so proxy rotation, pacing and CAPTCHA handling stay in one place.

pub mod json_feed;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::ScrapeError;
use crate::market::fingerprint::Fingerprint;
use crate::session::Session;
use crate::types::{Deal, PartialListing};

pub use json_feed::JsonFeedAdapter;

/// Search parameters for one site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub keywords: Option<String>,
    pub category: Option<String>,
}

/// Abstraction over retail and market-price sites.
///
/// Implementors must return `ScrapeError` values whose kind distinguishes
/// transient from permanent failures; the scanner retries only the former.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Site identifier used in deals, logs and reports.
    fn name(&self) -> &str;

    /// Whether this site needs a browser engine rather than plain HTTP.
    fn prefers_browser(&self) -> bool {
        false
    }

    /// Run a search and return the listings found.
    async fn search(
        &self,
        session: &dyn Session,
        query: &SearchQuery,
    ) -> Result<Vec<PartialListing>, ScrapeError>;

    /// Fetch one listing page and build a full deal from it.
    async fn get_detail(&self, session: &dyn Session, url: &str) -> Result<Deal, ScrapeError>;

    /// Whether `get_market_prices` returns anything.
    fn provides_market_prices(&self) -> bool {
        false
    }

    /// Resale prices keyed by product fingerprint.
    async fn get_market_prices(
        &self,
        _session: &dyn Session,
    ) -> Result<HashMap<Fingerprint, Decimal>, ScrapeError> {
        Ok(HashMap::new())
    }
}
