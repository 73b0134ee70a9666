//! Notifiers.
//!
//! Emit a summary of the current deal set on the report cadence. Failures
//! are returned to the caller, which logs them and carries on scanning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::report::{PassReport, RunSummary};
use crate::error::NotifyError;
use crate::types::Deal;

/// How many profitable deals a notification carries.
const TOP_DEALS: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportSummary {
    pub generated_at: DateTime<Utc>,
    pub run_id: Option<String>,
    pub passes: usize,
    pub deals_total: usize,
    pub profitable: usize,
    pub sites_ok: usize,
    pub sites_skipped: usize,
    pub sites_failed: usize,
}

impl ReportSummary {
    /// Summary over `deals`, with site counts from the most recent pass.
    pub fn new(deals: &[Deal], last_pass: Option<&PassReport>) -> Self {
        Self {
            generated_at: Utc::now(),
            run_id: last_pass.map(|p| p.run_id.clone()),
            passes: usize::from(last_pass.is_some()),
            deals_total: deals.len(),
            profitable: deals.iter().filter(|d| d.is_profitable()).count(),
            sites_ok: last_pass.map_or(0, |p| p.succeeded()),
            sites_skipped: last_pass.map_or(0, |p| p.skipped()),
            sites_failed: last_pass.map_or(0, |p| p.failed()),
        }
    }

    pub fn from_run(run: &RunSummary) -> Self {
        Self {
            run_id: Some(run.run_id.clone()),
            passes: run.passes.len(),
            ..Self::new(&run.deals, run.passes.last())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, deals: &[Deal], summary: &ReportSummary) -> Result<(), NotifyError>;
}

/// Profitable deals first, in the order given, capped at `TOP_DEALS`.
fn top_profitable(deals: &[Deal]) -> Vec<&Deal> {
    deals.iter().filter(|d| d.is_profitable()).take(TOP_DEALS).collect()
}

// ---------------------------------------------------------------------------
// Log notifier
// ---------------------------------------------------------------------------

/// Writes the summary through `tracing`.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, deals: &[Deal], summary: &ReportSummary) -> Result<(), NotifyError> {
        info!(
            run_id = summary.run_id.as_deref().unwrap_or("-"),
            deals = summary.deals_total,
            profitable = summary.profitable,
            sites_ok = summary.sites_ok,
            sites_skipped = summary.sites_skipped,
            sites_failed = summary.sites_failed,
            "Deal report"
        );
        for (rank, deal) in top_profitable(deals).into_iter().enumerate() {
            info!(rank = rank + 1, "{deal}");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Webhook notifier
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WebhookPayload<'a> {
    summary: &'a ReportSummary,
    deals: Vec<&'a Deal>,
}

/// POSTs the summary and top profitable deals as JSON.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, deals: &[Deal], summary: &ReportSummary) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            summary,
            deals: top_profitable(deals),
        };
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(status = status.as_u16(), deals = payload.deals.len(), "Webhook delivered");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
