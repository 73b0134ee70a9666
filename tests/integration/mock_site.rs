//! Mock site and session backends for integration testing.
//!
//! `MockSite` replays scripted listings pass by pass and fetches one page
//! through the session it is given, so CAPTCHA detection, proxy feedback
//! and pacing all run for real. `MockBackend` stands in for an engine and
//! can be told to fail at launch or to serve a CAPTCHA to one proxy.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dealscout::error::ScrapeError;
use dealscout::market::fingerprint::Fingerprint;
use dealscout::pacing::{RateLimiter, RetryPolicy};
use dealscout::proxy::{PoolSettings, ProxyPool};
use dealscout::session::{
    EngineKind, FacadeSettings, FetchedPage, Session, SessionBackend, SessionFacade, SessionSpec,
};
use dealscout::sites::{SearchQuery, SiteAdapter};
use dealscout::types::{Deal, PartialListing};

pub const CAPTCHA_BODY: &str = r#"<html><div class="g-recaptcha" data-sitekey="abc"></div></html>"#;
const OK_BODY: &str = r#"{"ok": true}"#;

// ---------------------------------------------------------------------------
// Site
// ---------------------------------------------------------------------------

pub struct MockSite {
    name: String,
    /// One entry per pass; the last one repeats.
    passes: Vec<Vec<PartialListing>>,
    market: HashMap<Fingerprint, Decimal>,
    browser: bool,
    searches: AtomicUsize,
    /// If set, every search fails with this error.
    force_error: Mutex<Option<fn() -> ScrapeError>>,
}

impl MockSite {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passes: vec![Vec::new()],
            market: HashMap::new(),
            browser: false,
            searches: AtomicUsize::new(0),
            force_error: Mutex::new(None),
        }
    }

    /// Listings with prices, one pass.
    pub fn with_listings(mut self, titles: &[(&str, Decimal, Decimal)]) -> Self {
        self.passes = vec![self.listings(titles)];
        self
    }

    /// Scripted passes of complete listings.
    pub fn with_passes(mut self, passes: &[&[(&str, Decimal, Decimal)]]) -> Self {
        self.passes = passes.iter().map(|p| self.listings(p)).collect();
        self
    }

    pub fn with_raw_listings(mut self, listings: Vec<PartialListing>) -> Self {
        self.passes = vec![listings];
        self
    }

    pub fn with_market_price(mut self, title: &str, price: Decimal) -> Self {
        if let Some(fp) = Fingerprint::title(title) {
            self.market.insert(fp, price);
        }
        self
    }

    pub fn browser_only(mut self) -> Self {
        self.browser = true;
        self
    }

    pub fn set_error(&self, make: fn() -> ScrapeError) {
        *self.force_error.lock().unwrap() = Some(make);
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    fn listings(&self, titles: &[(&str, Decimal, Decimal)]) -> Vec<PartialListing> {
        titles
            .iter()
            .map(|(title, price, original)| PartialListing {
                site: self.name.clone(),
                title: title.to_string(),
                url: None,
                brand: None,
                sku: None,
                price: Some(*price),
                original_price: Some(*original),
            })
            .collect()
    }
}

#[async_trait]
impl SiteAdapter for MockSite {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefers_browser(&self) -> bool {
        self.browser
    }

    async fn search(&self, session: &dyn Session, _query: &SearchQuery) -> Result<Vec<PartialListing>, ScrapeError> {
        let pass = self.searches.fetch_add(1, Ordering::SeqCst);
        let forced = *self.force_error.lock().unwrap();
        if let Some(make) = forced {
            return Err(make());
        }
        session.fetch(&format!("https://{}.test/search", self.name)).await?;
        let idx = pass.min(self.passes.len() - 1);
        Ok(self.passes[idx].clone())
    }

    async fn get_detail(&self, session: &dyn Session, url: &str) -> Result<Deal, ScrapeError> {
        session.fetch(url).await?;
        if url.contains("broken") {
            return Err(ScrapeError::Parse(format!("no price on {url}")));
        }
        Ok(Deal::new(self.name.clone(), "Detail Item", Decimal::from(40), Decimal::from(80)).with_url(url))
    }

    fn provides_market_prices(&self) -> bool {
        !self.market.is_empty()
    }

    async fn get_market_prices(&self, session: &dyn Session) -> Result<HashMap<Fingerprint, Decimal>, ScrapeError> {
        session.fetch(&format!("https://{}.test/prices", self.name)).await?;
        Ok(self.market.clone())
    }
}

// ---------------------------------------------------------------------------
// Session backends
// ---------------------------------------------------------------------------

pub struct MockBackend {
    kind: EngineKind,
    fail_launch: bool,
    captcha_proxy: Option<String>,
    forbidden_proxy: Option<String>,
    pub launches: AtomicUsize,
    pub proxies_seen: Mutex<Vec<Option<String>>>,
}

impl MockBackend {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            fail_launch: false,
            captcha_proxy: None,
            forbidden_proxy: None,
            launches: AtomicUsize::new(0),
            proxies_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(kind: EngineKind) -> Self {
        Self {
            fail_launch: true,
            ..Self::new(kind)
        }
    }

    /// Serve a CAPTCHA page to sessions going through proxy `id`.
    pub fn captcha_for(mut self, id: &str) -> Self {
        self.captcha_proxy = Some(id.to_string());
        self
    }

    /// Answer HTTP 403 to sessions going through proxy `id`.
    pub fn forbidden_for(mut self, id: &str) -> Self {
        self.forbidden_proxy = Some(id.to_string());
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionBackend for MockBackend {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn launch(&self, spec: &SessionSpec) -> Result<Box<dyn Session>, ScrapeError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let proxy = spec.proxy.as_ref().map(|p| p.id.clone());
        self.proxies_seen.lock().unwrap().push(proxy.clone());
        if self.fail_launch {
            return Err(ScrapeError::SessionInit {
                engine: self.kind.to_string(),
                reason: "mock launch failure".into(),
            });
        }
        let captcha = proxy.is_some() && proxy == self.captcha_proxy;
        let forbidden = proxy.is_some() && proxy == self.forbidden_proxy;
        Ok(Box::new(MockSession {
            kind: self.kind,
            body: if captcha { CAPTCHA_BODY } else { OK_BODY },
            forbidden,
        }))
    }
}

struct MockSession {
    kind: EngineKind,
    body: &'static str,
    forbidden: bool,
}

#[async_trait]
impl Session for MockSession {
    fn engine(&self) -> EngineKind {
        self.kind
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        if self.forbidden {
            return Err(ScrapeError::from_status(403, url));
        }
        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            body: self.body.to_string(),
            engine: self.kind,
        })
    }

    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

pub fn facade(backends: Vec<Arc<dyn SessionBackend>>, pool: Arc<ProxyPool>, settings: FacadeSettings) -> Arc<SessionFacade> {
    Arc::new(SessionFacade::new(
        backends,
        pool,
        Arc::new(RateLimiter::new(Duration::ZERO, Duration::ZERO)),
        settings,
    ))
}

pub fn empty_pool() -> Arc<ProxyPool> {
    Arc::new(ProxyPool::new(PoolSettings::default()))
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
    }
}
