//! Pass-level reporting.
//!
//! Failures are isolated per site and aggregated here, so a pass always
//! completes with whatever deals were scored plus per-site counts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::engine::controller::ControllerState;
use crate::types::Deal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SiteStatus {
    /// Everything the search returned was processed.
    Ok,
    /// Search succeeded but some items were skipped.
    Partial,
    /// Not scanned this pass (no proxy, or shutdown requested).
    Skipped,
    /// Definitive failure for this pass.
    Failed,
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SiteStatus::Ok => "ok",
            SiteStatus::Partial => "partial",
            SiteStatus::Skipped => "skipped",
            SiteStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site: String,
    pub status: SiteStatus,
    pub listings: usize,
    pub deals: usize,
    /// Items dropped because their content could not be interpreted.
    pub parse_skips: usize,
    /// Detail fetches that failed after retries.
    pub detail_failures: usize,
    pub market_prices: usize,
    /// Session retries caused by a proxy ban or CAPTCHA.
    pub proxy_retries: u32,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl SiteReport {
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            status: SiteStatus::Ok,
            listings: 0,
            deals: 0,
            parse_skips: 0,
            detail_failures: 0,
            market_prices: 0,
            proxy_retries: 0,
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn skipped(site: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status: SiteStatus::Skipped,
            error: Some(reason.into()),
            ..Self::new(site)
        }
    }

    /// Reset per-attempt counters before a session retry.
    pub(crate) fn reset_counts(&mut self) {
        self.listings = 0;
        self.deals = 0;
        self.parse_skips = 0;
        self.detail_failures = 0;
        self.market_prices = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub run_id: String,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: Vec<SiteReport>,
    pub deals_found: usize,
    pub profitable: usize,
}

impl PassReport {
    fn count(&self, status: SiteStatus) -> usize {
        self.sites.iter().filter(|s| s.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(SiteStatus::Ok) + self.count(SiteStatus::Partial)
    }

    pub fn skipped(&self) -> usize {
        self.count(SiteStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(SiteStatus::Failed)
    }
}

/// What one scan pass produced.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub report: PassReport,
    /// Enriched, filtered and ranked.
    pub deals: Vec<Deal>,
}

/// Result of a full controller run (one or more passes).
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub iterations: u32,
    /// Stopped because a pass found nothing new, not because of the cap.
    pub converged: bool,
    pub cancelled: bool,
    pub states: Vec<ControllerState>,
    pub passes: Vec<PassReport>,
    /// Union over all passes, deduplicated by unique key and ranked.
    pub deals: Vec<Deal>,
}

impl RunSummary {
    pub fn profitable(&self) -> impl Iterator<Item = &Deal> {
        self.deals.iter().filter(|d| d.is_profitable())
    }
}
