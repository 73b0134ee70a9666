//! Rate Limiter & Retry.
//!
//! `RateLimiter::pace` sleeps a random delay inside the configured window
//! before each request to a site; a site that answers with a rate-limit
//! status gets its window doubled (up to 8x) until its next success.
//! `RetryPolicy::run` retries transient failures with linear backoff
//! (`base_delay * attempt`) and propagates everything else immediately.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PacingConfig;
use crate::error::ScrapeError;
use crate::types::{AttemptOutcome, ScrapeAttempt};

/// Upper bound for the per-site penalty multiplier.
const MAX_PENALTY: u32 = 8;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SitePacing {
    penalty: u32,
    requests: u64,
}

impl Default for SitePacing {
    fn default() -> Self {
        Self {
            penalty: 1,
            requests: 0,
        }
    }
}

pub struct RateLimiter {
    min: Duration,
    max: Duration,
    sites: Mutex<HashMap<String, SitePacing>>,
}

impl RateLimiter {
    pub fn new(min: Duration, max: Duration) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            sites: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &PacingConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.min_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        )
    }

    /// Pick the delay for the next request to `site` and count the request.
    pub fn next_delay(&self, site: &str) -> Duration {
        let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = sites.entry(site.to_string()).or_default();
        entry.requests += 1;

        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let base = if max_ms > min_ms {
            rand::thread_rng().gen_range(min_ms..=max_ms)
        } else {
            min_ms
        };
        Duration::from_millis(base.saturating_mul(entry.penalty as u64))
    }

    /// Sleep before a request to `site`.
    pub async fn pace(&self, site: &str) {
        let delay = self.next_delay(site);
        if delay.is_zero() {
            return;
        }
        debug!(site, delay_ms = delay.as_millis() as u64, "Pacing request");
        tokio::time::sleep(delay).await;
    }

    /// Adapt the site's window to the outcome of a request.
    pub fn observe(&self, attempt: &ScrapeAttempt) {
        let mut sites = self.sites.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = sites.entry(attempt.site.clone()).or_default();
        match attempt.outcome {
            AttemptOutcome::RateLimited => {
                let next = (entry.penalty * 2).min(MAX_PENALTY);
                if next != entry.penalty {
                    warn!(site = %attempt.site, penalty = next, "Rate limited, widening pacing window");
                }
                entry.penalty = next;
            }
            AttemptOutcome::Success => entry.penalty = 1,
            _ => {}
        }
    }

    pub fn penalty(&self, site: &str) -> u32 {
        self.sites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(site)
            .map_or(1, |s| s.penalty)
    }

    pub fn request_count(&self, site: &str) -> u64 {
        self.sites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(site)
            .map_or(0, |s| s.requests)
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &PacingConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        }
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// `op` receives the 1-based attempt number. Only transient errors are
    /// retried; the last error is returned once retries are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ScrapeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ScrapeError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let wait = self.backoff(attempt);
                    warn!(
                        op = label,
                        attempt,
                        delay_ms = wait.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(op = label, attempts = attempt, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
