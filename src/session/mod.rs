//! Browser/Session Facade.
//!
//! Hands out one scoped network session per adapter call. Engines are tried
//! in order (stealth browser, plain browser, plain HTTP) and the first that
//! launches wins. Each acquisition may pick a different proxy and user
//! agent. The returned [`ScopedSession`] paces requests, detects CAPTCHA
//! pages, feeds outcomes back to the proxy pool and rate limiter, and
//! releases the engine on `close` or, failing that, on drop.

pub mod browser;
pub mod captcha;
pub mod fingerprint;
pub mod http;

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{ProxyConfig, SessionConfig};
use crate::error::ScrapeError;
use crate::pacing::RateLimiter;
use crate::proxy::{ProxyLease, ProxyPool, RotationStrategy};
use crate::types::{AttemptOutcome, ScrapeAttempt};

pub use fingerprint::BrowserFingerprint;

// ---------------------------------------------------------------------------
// Session seams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Browser automation with automation-fingerprint suppression.
    Chromium,
    /// Second browser launch profile: plain, or an alternate executable.
    AlternateBrowser,
    /// Request-based HTTP client, no browser.
    Http,
}

impl EngineKind {
    pub fn is_browser(&self) -> bool {
        !matches!(self, EngineKind::Http)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineKind::Chromium => "chromium",
            EngineKind::AlternateBrowser => "alternate-browser",
            EngineKind::Http => "http",
        };
        f.write_str(s)
    }
}

/// A page as returned by a session.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub engine: EngineKind,
}

/// A live network session. Methods take `&self` so adapters can issue
/// several requests through a shared reference.
#[async_trait]
pub trait Session: Send + Sync {
    fn engine(&self) -> EngineKind;

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError>;

    /// Release engine resources. Calling it more than once is harmless.
    async fn close(&self);
}

/// Everything a backend needs to launch one session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub site: String,
    pub fingerprint: BrowserFingerprint,
    pub proxy: Option<ProxyLease>,
    pub timeout: Duration,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn kind(&self) -> EngineKind;

    async fn launch(&self, spec: &SessionSpec) -> Result<Box<dyn Session>, ScrapeError>;
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FacadeSettings {
    pub use_proxy: bool,
    pub direct_fallback: bool,
    pub strategy: RotationStrategy,
    pub captcha_detection: bool,
    pub rotate_user_agent: bool,
    pub viewport: (u32, u32),
    pub timeout: Duration,
}

impl Default for FacadeSettings {
    fn default() -> Self {
        Self {
            use_proxy: false,
            direct_fallback: true,
            strategy: RotationStrategy::RoundRobin,
            captcha_detection: true,
            rotate_user_agent: true,
            viewport: (1920, 1080),
            timeout: Duration::from_secs(30),
        }
    }
}

impl FacadeSettings {
    pub fn from_config(session: &SessionConfig, proxy: &ProxyConfig) -> Self {
        Self {
            use_proxy: proxy.use_proxy,
            direct_fallback: proxy.direct_fallback,
            strategy: proxy.rotation_strategy,
            captcha_detection: session.captcha_detection,
            rotate_user_agent: session.rotate_user_agent,
            viewport: (session.viewport_width, session.viewport_height),
            timeout: session.request_timeout(),
        }
    }
}

pub struct SessionFacade {
    backends: Vec<Arc<dyn SessionBackend>>,
    pool: Arc<ProxyPool>,
    limiter: Arc<RateLimiter>,
    settings: FacadeSettings,
}

impl SessionFacade {
    /// `backends` is the fallback chain, tried in order.
    pub fn new(
        backends: Vec<Arc<dyn SessionBackend>>,
        pool: Arc<ProxyPool>,
        limiter: Arc<RateLimiter>,
        settings: FacadeSettings,
    ) -> Self {
        Self {
            backends,
            pool,
            limiter,
            settings,
        }
    }

    /// The default chain for a configuration: stealth Chromium, plain or
    /// alternate browser, then HTTP. Browsers are left out when disabled.
    pub fn default_backends(cfg: &SessionConfig) -> Vec<Arc<dyn SessionBackend>> {
        let mut chain: Vec<Arc<dyn SessionBackend>> = Vec::new();
        if cfg.enable_browser {
            chain.push(Arc::new(browser::ChromiumBackend::primary(cfg)));
            chain.push(Arc::new(browser::ChromiumBackend::alternate(cfg)));
        }
        chain.push(Arc::new(http::HttpBackend));
        chain
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn settings(&self) -> &FacadeSettings {
        &self.settings
    }

    /// Open a scoped session for one adapter call against `site`.
    ///
    /// Browser engines are only tried when `prefer_browser` is set. Fails
    /// with `NoProxy` when proxies are required but none is available, and
    /// with `SessionInit` when every engine in the chain failed.
    pub async fn open(&self, site: &str, prefer_browser: bool) -> Result<ScopedSession, ScrapeError> {
        let proxy = self.pick_proxy(site)?;
        let fingerprint = if self.settings.rotate_user_agent {
            BrowserFingerprint::randomized()
        } else {
            BrowserFingerprint::fixed(self.settings.viewport.0, self.settings.viewport.1)
        };
        let spec = SessionSpec {
            site: site.to_string(),
            fingerprint,
            proxy,
            timeout: self.settings.timeout,
        };

        let mut failures = Vec::new();
        for backend in self
            .backends
            .iter()
            .filter(|b| prefer_browser || !b.kind().is_browser())
        {
            match backend.launch(&spec).await {
                Ok(inner) => {
                    info!(
                        site,
                        engine = %backend.kind(),
                        proxy = spec.proxy.as_ref().map(|p| p.id.as_str()).unwrap_or("direct"),
                        "Session opened"
                    );
                    return Ok(ScopedSession {
                        inner: Some(inner),
                        site: site.to_string(),
                        lease: spec.proxy,
                        pool: self.pool.clone(),
                        limiter: self.limiter.clone(),
                        captcha_detection: self.settings.captcha_detection,
                        closed: AtomicBool::new(false),
                        attempts: Mutex::new(Vec::new()),
                    });
                }
                Err(e) => {
                    warn!(site, engine = %backend.kind(), error = %e, "Session init failed, trying next engine");
                    failures.push(format!("{}: {e}", backend.kind()));
                }
            }
        }

        Err(ScrapeError::SessionInit {
            engine: "all".to_string(),
            reason: if failures.is_empty() {
                "no session engine configured".to_string()
            } else {
                failures.join("; ")
            },
        })
    }

    fn pick_proxy(&self, site: &str) -> Result<Option<ProxyLease>, ScrapeError> {
        if !self.settings.use_proxy {
            return Ok(None);
        }
        match self.pool.acquire(self.settings.strategy) {
            Some(lease) => Ok(Some(lease)),
            None if self.settings.direct_fallback => {
                warn!(site, "No proxy available, going direct");
                Ok(None)
            }
            None => Err(ScrapeError::NoProxy),
        }
    }
}

// ---------------------------------------------------------------------------
// Scoped session
// ---------------------------------------------------------------------------

/// Session guard for one adapter call.
pub struct ScopedSession {
    inner: Option<Box<dyn Session>>,
    site: String,
    lease: Option<ProxyLease>,
    pool: Arc<ProxyPool>,
    limiter: Arc<RateLimiter>,
    captcha_detection: bool,
    closed: AtomicBool,
    attempts: Mutex<Vec<ScrapeAttempt>>,
}

impl ScopedSession {
    pub fn proxy(&self) -> Option<&ProxyLease> {
        self.lease.as_ref()
    }

    /// Requests issued through this session so far.
    pub fn attempts(&self) -> Vec<ScrapeAttempt> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, outcome: AttemptOutcome, latency: Duration) {
        let attempt = ScrapeAttempt {
            site: self.site.clone(),
            proxy: self.lease.as_ref().map(|l| l.id.clone()),
            outcome,
            latency,
        };
        self.pool.record_attempt(&attempt);
        self.limiter.observe(&attempt);
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(attempt);
    }
}

#[async_trait]
impl Session for ScopedSession {
    fn engine(&self) -> EngineKind {
        self.inner
            .as_ref()
            .map_or(EngineKind::Http, |s| s.engine())
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let Some(inner) = self.inner.as_ref() else {
            return Err(ScrapeError::SessionInit {
                engine: "closed".to_string(),
                reason: "session already released".to_string(),
            });
        };

        self.limiter.pace(&self.site).await;
        let started = Instant::now();
        let result = inner.fetch(url).await;
        let latency = started.elapsed();

        let result = match result {
            Ok(page) if self.captcha_detection => match captcha::detect(&page.body) {
                Some(kind) => Err(ScrapeError::Captcha {
                    kind: kind.to_string(),
                }),
                None => Ok(page),
            },
            other => other,
        };

        let outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(ScrapeError::Captcha { .. }) => AttemptOutcome::Captcha,
            Err(ScrapeError::RateLimited { .. }) => AttemptOutcome::RateLimited,
            Err(e) => AttemptOutcome::Failed(e.kind()),
        };
        debug!(
            site = %self.site,
            url,
            latency_ms = latency.as_millis() as u64,
            outcome = ?outcome,
            "Fetch finished"
        );
        if outcome == AttemptOutcome::Captcha {
            warn!(site = %self.site, proxy = self.lease.as_ref().map(|l| l.id.as_str()).unwrap_or("direct"), "CAPTCHA detected");
        }
        self.record(outcome, latency);
        result
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.as_ref() {
            inner.close().await;
            debug!(site = %self.site, engine = %inner.engine(), "Session released");
        }
    }
}

impl Drop for ScopedSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.inner.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(site = %self.site, "Session dropped without close, releasing in background");
                handle.spawn(async move { inner.close().await });
            }
            Err(_) => warn!(site = %self.site, "Session dropped outside a runtime, engine not closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
