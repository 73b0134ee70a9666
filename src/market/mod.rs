//! Market Price Resolver.
//!
//! Aggregates market prices reported by adapters, keyed by product
//! fingerprint, and enriches deals with profit scores. The record map is a
//! `DashMap` so parallel site workers can insert without lost updates.

pub mod fingerprint;
pub mod profit;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::types::{Deal, ProfitScore};
use fingerprint::{normalize_sku, normalize_title, similarity, Fingerprint};

/// Minimum normalised SKU length for partial (substring) SKU matches.
const MIN_PARTIAL_SKU_LEN: usize = 5;

/// Default title similarity needed for a fuzzy match.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.8;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One observed market price for a fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketPriceRecord {
    pub fingerprint: Fingerprint,
    pub price: Decimal,
    pub source: String,
    pub observed_at: DateTime<Utc>,
}

/// How a deal was matched to its market price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    PartialSku,
    FuzzyTitle,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub profit_threshold: Decimal,
    pub fuzzy_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            profit_threshold: profit::DEFAULT_PROFIT_THRESHOLD,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct MarketPriceResolver {
    config: ResolverConfig,
    records: DashMap<Fingerprint, MarketPriceRecord>,
}

impl MarketPriceResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record a price observed now. Returns whether the stored record changed.
    pub fn add_market_price(&self, fingerprint: Fingerprint, price: Decimal, source: &str) -> bool {
        self.add_record(MarketPriceRecord {
            fingerprint,
            price,
            source: source.to_string(),
            observed_at: Utc::now(),
        })
    }

    /// Insert or update, keeping the newest observation per fingerprint.
    /// Non-positive prices are ignored.
    pub fn add_record(&self, record: MarketPriceRecord) -> bool {
        if record.price <= Decimal::ZERO {
            debug!(fingerprint = %record.fingerprint, price = %record.price, "Ignoring non-positive market price");
            return false;
        }

        match self.records.entry(record.fingerprint.clone()) {
            Entry::Occupied(mut existing) => {
                if record.observed_at >= existing.get().observed_at {
                    existing.insert(record);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Look up the market price for a listing.
    ///
    /// Order: exact SKU, exact title, partial SKU containment, then the best
    /// fuzzy title match at or above the configured threshold.
    pub fn resolve(&self, sku: Option<&str>, title: &str) -> Option<(MarketPriceRecord, MatchKind)> {
        let sku_fp = sku.and_then(Fingerprint::sku);
        let title_fp = Fingerprint::title(title);

        for fp in sku_fp.iter().chain(title_fp.iter()) {
            if let Some(rec) = self.records.get(fp) {
                return Some((rec.clone(), MatchKind::Exact));
            }
        }

        if let Some(Fingerprint::Sku(ref wanted)) = sku_fp {
            if let Some(rec) = self.partial_sku_match(wanted) {
                return Some((rec, MatchKind::PartialSku));
            }
        }

        self.fuzzy_title_match(title)
            .map(|rec| (rec, MatchKind::FuzzyTitle))
    }

    fn partial_sku_match(&self, wanted: &str) -> Option<MarketPriceRecord> {
        if wanted.len() < MIN_PARTIAL_SKU_LEN {
            return None;
        }
        self.records.iter().find_map(|entry| match entry.key() {
            Fingerprint::Sku(key)
                if key.len() >= MIN_PARTIAL_SKU_LEN
                    && (key.contains(wanted) || wanted.contains(key.as_str())) =>
            {
                Some(entry.value().clone())
            }
            _ => None,
        })
    }

    fn fuzzy_title_match(&self, title: &str) -> Option<MarketPriceRecord> {
        let normalized = normalize_title(title);
        if normalized.is_empty() {
            return None;
        }

        let mut best: Option<(f64, MarketPriceRecord)> = None;
        for entry in self.records.iter() {
            let Fingerprint::Title(key) = entry.key() else {
                continue;
            };
            let score = similarity(&normalized, key);
            if score < self.config.fuzzy_threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, entry.value().clone()));
            }
        }

        if let Some((score, ref rec)) = best {
            debug!(title, matched = %rec.fingerprint, score, "Fuzzy market-price match");
        }
        best.map(|(_, rec)| rec)
    }

    /// Profit score for a deal against its resolved market price.
    pub fn score(&self, deal: &Deal) -> ProfitScore {
        match self.resolve(deal.sku.as_deref(), &deal.title) {
            Some((rec, _)) => profit::score(deal.price, rec.price, self.config.profit_threshold),
            None => ProfitScore::ZERO,
        }
    }

    /// Attach market prices and profit figures to a batch of deals.
    pub fn enrich(&self, deals: Vec<Deal>) -> Vec<Deal> {
        let mut matched = 0usize;
        let enriched: Vec<Deal> = deals
            .into_iter()
            .map(|mut deal| {
                let market = self
                    .resolve(deal.sku.as_deref(), &deal.title)
                    .map(|(rec, _)| rec.price);
                if market.is_some() {
                    matched += 1;
                }
                deal.apply_market_price(market, self.config.profit_threshold);
                deal
            })
            .collect();

        info!(
            deals = enriched.len(),
            matched,
            records = self.records.len(),
            "Market price enrichment complete"
        );
        enriched
    }

    /// Snapshot of all records (for reporting).
    pub fn records(&self) -> Vec<MarketPriceRecord> {
        let mut out: Vec<_> = self.records.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        out
    }
}

/// Shorthand used by adapters reporting prices keyed by raw SKU.
pub fn sku_key(raw: &str) -> String {
    normalize_sku(raw)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn resolver(fuzzy: f64) -> MarketPriceResolver {
        MarketPriceResolver::new(ResolverConfig {
            profit_threshold: dec!(20),
            fuzzy_threshold: fuzzy,
        })
    }

    fn title_fp(s: &str) -> Fingerprint {
        Fingerprint::title(s).unwrap()
    }

    #[test]
    fn test_exact_sku_resolution() {
        let r = resolver(0.8);
        r.add_market_price(Fingerprint::sku("DD1391-100").unwrap(), dec!(160), "stockx");
        let (rec, kind) = r.resolve(Some("dd1391 100"), "anything").unwrap();
        assert_eq!(rec.price, dec!(160));
        assert_eq!(kind, MatchKind::Exact);
    }

    #[test]
    fn test_newest_observation_wins() {
        let r = resolver(0.8);
        let fp = title_fp("Samba OG");
        let now = Utc::now();
        r.add_record(MarketPriceRecord {
            fingerprint: fp.clone(),
            price: dec!(120),
            source: "goat".into(),
            observed_at: now,
        });
        let older = r.add_record(MarketPriceRecord {
            fingerprint: fp.clone(),
            price: dec!(90),
            source: "stockx".into(),
            observed_at: now - Duration::minutes(5),
        });
        assert!(!older);
        assert_eq!(r.resolve(None, "Samba OG").unwrap().0.price, dec!(120));

        let newer = r.add_record(MarketPriceRecord {
            fingerprint: fp,
            price: dec!(130),
            source: "stockx".into(),
            observed_at: now + Duration::minutes(5),
        });
        assert!(newer);
        let (rec, _) = r.resolve(None, "Samba OG").unwrap();
        assert_eq!(rec.price, dec!(130));
        assert_eq!(rec.source, "stockx");
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_non_positive_price_ignored() {
        let r = resolver(0.8);
        assert!(!r.add_market_price(title_fp("Samba"), Decimal::ZERO, "x"));
        assert!(r.is_empty());
    }

    #[test]
    fn test_fuzzy_match_above_threshold() {
        let r = resolver(0.85);
        r.add_market_price(title_fp("Air Jordan 1 Retro High"), dec!(250), "stockx");
        let (rec, kind) = r.resolve(Some("UNKNOWN-1"), "Air Jordan 1 Retro High OG").unwrap();
        assert_eq!(rec.price, dec!(250));
        assert_eq!(kind, MatchKind::FuzzyTitle);
    }

    #[test]
    fn test_fuzzy_match_below_threshold() {
        let r = resolver(0.95);
        r.add_market_price(title_fp("Air Jordan 1 Retro High"), dec!(250), "stockx");
        assert!(r.resolve(Some("UNKNOWN-1"), "Air Jordan 1 Retro High OG").is_none());
    }

    #[test]
    fn test_fuzzy_picks_best_candidate() {
        let r = resolver(0.5);
        r.add_market_price(title_fp("Air Jordan 1 Retro"), dec!(200), "a");
        r.add_market_price(title_fp("Air Jordan 1 Retro High"), dec!(250), "b");
        let (rec, _) = r.resolve(None, "Air Jordan 1 Retro High OG").unwrap();
        assert_eq!(rec.price, dec!(250));
    }

    #[test]
    fn test_partial_sku_match() {
        let r = resolver(0.8);
        r.add_market_price(Fingerprint::sku("555088-134-10").unwrap(), dec!(300), "goat");
        let (rec, kind) = r.resolve(Some("555088-134"), "AJ1").unwrap();
        assert_eq!(rec.price, dec!(300));
        assert_eq!(kind, MatchKind::PartialSku);
    }

    #[test]
    fn test_score_and_enrich() {
        let r = resolver(0.8);
        r.add_market_price(Fingerprint::sku("DD1391-100").unwrap(), dec!(150), "stockx");

        let hit = Deal::new("outlet", "Dunk Low Panda", dec!(100), dec!(120)).with_sku("DD1391-100");
        let miss = Deal::new("outlet", "Random Sock", dec!(10), dec!(20));
        let s = r.score(&hit);
        assert_eq!(s.profit_amount, dec!(50));
        assert!(s.is_profitable);
        assert_eq!(r.score(&miss), ProfitScore::ZERO);

        let enriched = r.enrich(vec![hit, miss]);
        assert_eq!(enriched[0].market_price(), Some(dec!(150)));
        assert!(enriched[0].is_profitable());
        assert_eq!(enriched[1].market_price(), None);
        assert!(!enriched[1].is_profitable());
    }

    #[tokio::test]
    async fn test_concurrent_inserts_keep_one_record_per_key() {
        let r = Arc::new(resolver(0.8));
        let mut handles = Vec::new();
        for i in 0..16u32 {
            let r = r.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50u32 {
                    let fp = Fingerprint::title(&format!("shoe {}", j % 10)).unwrap();
                    r.add_market_price(fp, Decimal::from(100 + i), "worker");
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(r.len(), 10);
    }
}
