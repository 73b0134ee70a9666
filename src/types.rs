//! Shared types for the deal-discovery engine.
//!
//! These types form the data model used across all modules.
//! Profit fields on `Deal` are derived from its prices and resolved
//! market price; they are never set independently.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::error::ErrorKind;
use crate::market::fingerprint::{normalize_sku, normalize_title, Fingerprint};
use crate::market::profit;

/// Query parameters stripped when canonicalising listing URLs.
const TRACKING_PARAMS: &[&str] = &["_nocache", "ref", "gclid", "fbclid", "mc_cid", "mc_eid"];

// ---------------------------------------------------------------------------
// Partial listing
// ---------------------------------------------------------------------------

/// A search result as returned by a site adapter, before detail fetching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialListing {
    pub site: String,
    pub title: String,
    pub url: Option<String>,
    pub brand: Option<String>,
    pub sku: Option<String>,
    pub price: Option<Decimal>,
    pub original_price: Option<Decimal>,
}

impl PartialListing {
    /// Whether the listing carries enough data to become a `Deal` without
    /// a detail fetch.
    pub fn is_complete(&self) -> bool {
        self.price.is_some() && self.original_price.is_some() && !self.title.trim().is_empty()
    }

    /// Convert a complete listing into a deal. Returns `None` if prices are
    /// missing.
    pub fn into_deal(self, discovered_at: DateTime<Utc>) -> Option<Deal> {
        let price = self.price?;
        let original_price = self.original_price?;
        let mut deal = Deal::new(self.site, self.title, price, original_price);
        deal.brand = self.brand;
        deal.sku = self.sku;
        deal.url = self.url.map(|u| canonical_url(&u));
        deal.discovered_at = discovered_at;
        Some(deal)
    }
}

// ---------------------------------------------------------------------------
// Profit score
// ---------------------------------------------------------------------------

/// Derived profit figures for a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfitScore {
    pub profit_amount: Decimal,
    pub profit_percentage: Decimal,
    pub is_profitable: bool,
}

impl ProfitScore {
    pub const ZERO: ProfitScore = ProfitScore {
        profit_amount: Decimal::ZERO,
        profit_percentage: Decimal::ZERO,
        is_profitable: false,
    };
}

// ---------------------------------------------------------------------------
// Deal
// ---------------------------------------------------------------------------

/// A discovered listing enriched with computed profit fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deal {
    pub site: String,
    pub title: String,
    pub brand: Option<String>,
    pub sku: Option<String>,
    /// Price the listing is offered at.
    pub price: Decimal,
    /// Retail / MSRP before discount.
    pub original_price: Decimal,
    pub discount_percent: Decimal,
    /// Canonical listing URL.
    pub url: Option<String>,
    pub discovered_at: DateTime<Utc>,
    market_price: Option<Decimal>,
    profit: ProfitScore,
}

impl Deal {
    pub fn new(
        site: impl Into<String>,
        title: impl Into<String>,
        price: Decimal,
        original_price: Decimal,
    ) -> Self {
        Self {
            site: site.into(),
            title: title.into(),
            brand: None,
            sku: None,
            price,
            original_price,
            discount_percent: discount_percent(price, original_price),
            url: None,
            discovered_at: Utc::now(),
            market_price: None,
            profit: ProfitScore::ZERO,
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(canonical_url(url));
        self
    }

    pub fn market_price(&self) -> Option<Decimal> {
        self.market_price
    }

    pub fn profit(&self) -> ProfitScore {
        self.profit
    }

    pub fn is_profitable(&self) -> bool {
        self.profit.is_profitable
    }

    /// Attach a resolved market price and recompute the derived profit.
    pub fn apply_market_price(&mut self, market_price: Option<Decimal>, threshold: Decimal) {
        self.market_price = market_price;
        self.profit = match market_price {
            Some(market) => profit::score(self.price, market, threshold),
            None => ProfitScore::ZERO,
        };
    }

    /// Recompute the derived discount after a price change (e.g. when a
    /// later pass observes the same listing at a new price).
    pub fn refresh_derived(&mut self, threshold: Decimal) {
        self.discount_percent = discount_percent(self.price, self.original_price);
        self.apply_market_price(self.market_price, threshold);
    }

    /// Join key for market-price data.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::for_listing(self.sku.as_deref(), &self.title)
    }

    /// Persistence uniqueness key: canonical URL, else site + SKU, else
    /// site + normalised title.
    pub fn unique_key(&self) -> String {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return format!("url:{url}");
        }
        if let Some(sku) = self.sku.as_deref().map(normalize_sku).filter(|s| !s.is_empty()) {
            return format!("sku:{}:{sku}", self.site);
        }
        format!("title:{}:{}", self.site, normalize_title(&self.title))
    }
}

impl fmt::Display for Deal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ${} (was ${}, -{}%)",
            self.site, self.title, self.price, self.original_price, self.discount_percent
        )?;
        if let Some(market) = self.market_price {
            write!(
                f,
                " | market ${} | profit ${} ({}%)",
                market, self.profit.profit_amount, self.profit.profit_percentage
            )?;
        }
        Ok(())
    }
}

/// Percentage discount from `original` to `price`, two decimals.
pub fn discount_percent(price: Decimal, original: Decimal) -> Decimal {
    if original <= Decimal::ZERO || price >= original {
        return Decimal::ZERO;
    }
    ((original - price) / original * dec!(100)).round_dp(2)
}

/// Normalise a listing URL so the same product page maps to one key.
///
/// Lowercases scheme and host (via `url`), drops the fragment, tracking
/// parameters and any trailing slash. Unparseable input is returned trimmed.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let path = url.path().trim_end_matches('/').to_string();
    if !path.is_empty() {
        url.set_path(&path);
    }

    let mut out = url.to_string();
    // "https://shop.example/" and "https://shop.example" are the same page
    if url.path() == "/" && url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    out
}

// ---------------------------------------------------------------------------
// Scrape attempts
// ---------------------------------------------------------------------------

/// Outcome of one request, fed back into proxy health and pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(ErrorKind),
    RateLimited,
    Captcha,
}

/// Ephemeral record of a single request. Never persisted.
#[derive(Debug, Clone)]
pub struct ScrapeAttempt {
    pub site: String,
    pub proxy: Option<String>,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
