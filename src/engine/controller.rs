//! Iterative convergence controller.
//!
//! Repeats scan passes until a pass discovers no deal fingerprints that the
//! previous pass had not already seen, the iteration cap is reached, or a
//! shutdown is requested. Passes are separated by a cooldown that a
//! shutdown interrupts immediately.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::report::{PassOutcome, RunSummary};
use crate::market::profit;
use crate::types::Deal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerState {
    Idle,
    Scanning,
    Comparing,
    CoolingDown,
    Done,
}

/// Anything that can run one scan pass. The scanner is the production
/// implementation; tests script passes directly.
#[async_trait]
pub trait PassRunner: Send + Sync {
    async fn run_pass(&self, iteration: u32, run_id: &str, cancel: &CancellationToken) -> PassOutcome;
}

/// Convergence bookkeeping across passes.
#[derive(Debug, Default, Clone)]
pub struct IterationState {
    pub iteration: u32,
    pub previous: HashSet<String>,
    pub current: HashSet<String>,
    pub continue_scanning: bool,
}

impl IterationState {
    /// Fingerprints seen this pass that the previous pass did not have.
    pub fn new_fingerprints(&self) -> usize {
        self.current.difference(&self.previous).count()
    }

    /// Rotate `current` into `previous` and record the new pass.
    fn advance(&mut self, deals: &[Deal]) {
        self.previous = std::mem::take(&mut self.current);
        self.current = deals.iter().map(|d| d.fingerprint().to_string()).collect();
    }
}

pub struct ConvergenceController {
    max_iterations: u32,
    cooldown: Duration,
}

impl ConvergenceController {
    pub fn new(max_iterations: u32, cooldown: Duration) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            cooldown,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.max_iterations, cfg.iteration_cooldown())
    }

    /// One pass, no iteration.
    pub fn single_pass() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub async fn run(&self, runner: &dyn PassRunner, cancel: &CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4().to_string();
        let mut states = vec![ControllerState::Idle];
        let mut state = IterationState {
            continue_scanning: true,
            ..IterationState::default()
        };
        let mut passes = Vec::new();
        // Keyed by unique key: a later pass replaces an earlier observation.
        let mut union: HashMap<String, Deal> = HashMap::new();
        let mut converged = false;

        info!(run_id = %run_id, max_iterations = self.max_iterations, "Run starting");

        while state.continue_scanning {
            state.iteration += 1;
            states.push(ControllerState::Scanning);
            let outcome = runner.run_pass(state.iteration, &run_id, cancel).await;

            states.push(ControllerState::Comparing);
            state.advance(&outcome.deals);
            let fresh = state.new_fingerprints();
            for deal in outcome.deals {
                union.insert(deal.unique_key(), deal);
            }
            passes.push(outcome.report);

            converged = fresh == 0;
            let capped = state.iteration >= self.max_iterations;
            state.continue_scanning = !converged && !capped && !cancel.is_cancelled();
            info!(
                run_id = %run_id,
                iteration = state.iteration,
                seen = state.current.len(),
                new = fresh,
                converged,
                capped,
                "Pass compared"
            );

            if state.continue_scanning && !self.cooldown.is_zero() {
                states.push(ControllerState::CoolingDown);
                debug!(secs = self.cooldown.as_secs(), "Cooling down before next pass");
                tokio::select! {
                    _ = tokio::time::sleep(self.cooldown) => {}
                    _ = cancel.cancelled() => {
                        info!(run_id = %run_id, "Shutdown during cooldown");
                        state.continue_scanning = false;
                    }
                }
            }
        }
        states.push(ControllerState::Done);

        let deals = profit::rank(union.into_values().collect());
        info!(
            run_id = %run_id,
            iterations = state.iteration,
            deals = deals.len(),
            converged,
            "Run finished"
        );

        RunSummary {
            run_id,
            iterations: state.iteration,
            converged,
            cancelled: cancel.is_cancelled(),
            states,
            passes,
            deals,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
