//! Product fingerprints and fuzzy title similarity.
//!
//! A fingerprint is the join key between a listing and market-price data:
//! the normalised SKU when one is known, otherwise the normalised title.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Normalised join key for market-price data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum Fingerprint {
    Sku(String),
    Title(String),
}

impl Fingerprint {
    /// Fingerprint from a raw SKU. `None` if nothing alphanumeric remains.
    pub fn sku(raw: &str) -> Option<Self> {
        let key = normalize_sku(raw);
        (!key.is_empty()).then_some(Fingerprint::Sku(key))
    }

    /// Fingerprint from a raw product title.
    pub fn title(raw: &str) -> Option<Self> {
        let key = normalize_title(raw);
        (!key.is_empty()).then_some(Fingerprint::Title(key))
    }

    /// SKU if present and usable, else title.
    pub fn for_listing(sku: Option<&str>, title: &str) -> Self {
        sku.and_then(Fingerprint::sku)
            .unwrap_or_else(|| Fingerprint::Title(normalize_title(title)))
    }

    pub fn key(&self) -> &str {
        match self {
            Fingerprint::Sku(k) | Fingerprint::Title(k) => k,
        }
    }

    pub fn is_sku(&self) -> bool {
        matches!(self, Fingerprint::Sku(_))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Sku(k) => write!(f, "sku:{k}"),
            Fingerprint::Title(k) => write!(f, "title:{k}"),
        }
    }
}

/// Parses `sku:<value>` / `title:<value>`; bare strings are treated as titles.
impl FromStr for Fingerprint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = if let Some(rest) = s.strip_prefix("sku:") {
            Fingerprint::sku(rest)
        } else if let Some(rest) = s.strip_prefix("title:") {
            Fingerprint::title(rest)
        } else {
            Fingerprint::title(s)
        };
        parsed.ok_or_else(|| anyhow::anyhow!("empty fingerprint: {s:?}"))
    }
}

/// Uppercase, alphanumeric-only SKU ("555088-134" -> "555088134").
pub fn normalize_sku(sku: &str) -> String {
    sku.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Lowercase alphanumeric tokens separated by single spaces.
pub fn normalize_title(title: &str) -> String {
    tokens(title).join(" ")
}

fn tokens(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

/// Normalised similarity between two product titles, 0.0 to 1.0.
///
/// Weighted blend of token Jaccard index and containment (the share of the
/// shorter title's tokens found in the longer one), so "Air Jordan 1 Retro
/// High" scores high against "Air Jordan 1 Retro High OG".
pub fn similarity(a: &str, b: &str) -> f64 {
    let words_a = tokens(a);
    let words_b = tokens(b);

    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let set_a: HashSet<&str> = words_a.iter().map(|s| s.as_str()).collect();
    let set_b: HashSet<&str> = words_b.iter().map(|s| s.as_str()).collect();

    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;

    let jaccard = if union > 0.0 { intersection / union } else { 0.0 };
    let containment = intersection / set_a.len().min(set_b.len()) as f64;

    (0.6 * jaccard + 0.4 * containment).min(1.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
