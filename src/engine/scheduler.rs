//! Continuous-mode scheduler.
//!
//! Two cadences share one loop: scan runs, re-armed after each run at a
//! jittered `interval..=1.5 * interval`, and reports at a fixed interval.
//! Scans are awaited inline, so a report that comes due mid-scan waits for
//! the scan to finish instead of overlapping it.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::dashboard::AppState;
use crate::engine::controller::{ConvergenceController, PassRunner};
use crate::engine::report::{PassReport, RunSummary};
use crate::notify::{Notifier, ReportSummary};
use crate::storage::DealStore;
use crate::types::Deal;

/// Counters for one `Scheduler::run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub scans: u64,
    pub reports: u64,
    pub save_failures: u64,
    pub notify_failures: u64,
    /// Distinct deals still unsaved when the loop stopped.
    pub unsaved: usize,
}

pub struct Scheduler {
    scan_interval: Duration,
    report_interval: Duration,
    idle_tick: Duration,
    controller: ConvergenceController,
    store: Arc<dyn DealStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
    dashboard: Option<AppState>,
}

impl Scheduler {
    pub fn new(cfg: &SchedulerConfig, controller: ConvergenceController, store: Arc<dyn DealStore>) -> Self {
        Self {
            scan_interval: Duration::from_secs(cfg.scan_interval_secs),
            report_interval: Duration::from_secs(cfg.report_interval_secs),
            idle_tick: Duration::from_millis(cfg.idle_tick_ms.max(1)),
            controller,
            store,
            notifiers: Vec::new(),
            dashboard: None,
        }
    }

    pub fn with_notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn with_dashboard(mut self, dashboard: AppState) -> Self {
        self.dashboard = Some(dashboard);
        self
    }

    /// Delay until the next scan, uniformly drawn from
    /// `scan_interval..=1.5 * scan_interval`.
    pub fn next_scan_delay(&self) -> Duration {
        let max = self.scan_interval.mul_f64(1.5);
        if max <= self.scan_interval {
            return self.scan_interval;
        }
        rand::thread_rng().gen_range(self.scan_interval..=max)
    }

    /// Run until `cancel` fires. The first scan starts immediately.
    pub async fn run(&self, runner: &dyn PassRunner, cancel: &CancellationToken) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        let mut next_scan = Instant::now();
        let mut next_report = Instant::now() + self.report_interval;
        let mut latest: Vec<Deal> = Vec::new();
        let mut last_pass: Option<PassReport> = None;
        // Deals whose save failed, keyed like the store so the newest
        // observation wins. Retried on the next save and at shutdown.
        let mut unsaved: HashMap<String, Deal> = HashMap::new();

        info!(
            scan_interval_secs = self.scan_interval.as_secs(),
            report_interval_secs = self.report_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if Instant::now() >= next_scan {
                let run = self.controller.run(runner, cancel).await;
                stats.scans += 1;
                last_pass = run.passes.last().cloned();
                unsaved.extend(run.deals.iter().map(|d| (d.unique_key(), d.clone())));
                if !self.save(&mut unsaved).await {
                    stats.save_failures += 1;
                }
                latest = self.current_deals(&run).await;
                self.publish(&run, &latest).await;

                let delay = self.next_scan_delay();
                next_scan = Instant::now() + delay;
                debug!(delay_secs = delay.as_secs(), "Next scan scheduled");
            }

            if Instant::now() >= next_report {
                let summary = ReportSummary::new(&latest, last_pass.as_ref());
                stats.notify_failures += self.notify_all(&latest, &summary).await;
                stats.reports += 1;
                next_report = Instant::now() + self.report_interval;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.idle_tick) => {}
                _ = cancel.cancelled() => break,
            }
        }

        if !unsaved.is_empty() && !self.save(&mut unsaved).await {
            stats.save_failures += 1;
        }
        stats.unsaved = unsaved.len();
        info!(
            scans = stats.scans,
            reports = stats.reports,
            unsaved = stats.unsaved,
            "Scheduler stopped"
        );
        stats
    }

    /// Save `pending`, clearing it on success.
    async fn save(&self, pending: &mut HashMap<String, Deal>) -> bool {
        if pending.is_empty() {
            return true;
        }
        let batch: Vec<Deal> = pending.values().cloned().collect();
        match self.store.save(&batch).await {
            Ok(report) => {
                debug!(inserted = report.inserted, updated = report.updated, "Deals persisted");
                pending.clear();
                true
            }
            Err(e) => {
                error!(error = %e, pending = pending.len(), "Failed to persist deals");
                false
            }
        }
    }

    /// Everything stored so far, or just this run's deals if the store
    /// cannot be read.
    async fn current_deals(&self, run: &RunSummary) -> Vec<Deal> {
        match self.store.all().await {
            Ok(deals) => deals,
            Err(e) => {
                warn!(error = %e, "Failed to read deal store, reporting this run only");
                run.deals.clone()
            }
        }
    }

    async fn publish(&self, run: &RunSummary, deals: &[Deal]) {
        let Some(dashboard) = &self.dashboard else {
            return;
        };
        dashboard.record_passes(&run.passes).await;
        dashboard.set_deals(deals.to_vec()).await;
    }

    /// Notify every notifier, returning how many failed.
    async fn notify_all(&self, deals: &[Deal], summary: &ReportSummary) -> u64 {
        let mut failures = 0;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(deals, summary).await {
                warn!(error = %e, "Notification failed");
                failures += 1;
            }
        }
        failures
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
