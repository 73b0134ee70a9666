//! Chromium-backed sessions via `chromiumoxide`.
//!
//! The primary profile launches with automation-fingerprint suppression
//! (blink flag plus a new-document script hiding `navigator.webdriver`).
//! The alternate profile is a plain launch, optionally of a different
//! executable, tried when the primary one fails to start.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{EngineKind, FetchedPage, Session, SessionBackend, SessionSpec};
use crate::config::SessionConfig;
use crate::error::ScrapeError;

const STEALTH_SCRIPT: &str = r#"
(() => {
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    window.chrome = window.chrome || { runtime: {} };
    const query = window.navigator.permissions && window.navigator.permissions.query;
    if (query) {
        window.navigator.permissions.query = (p) =>
            p && p.name === 'notifications'
                ? Promise.resolve({ state: Notification.permission })
                : query(p);
    }
})();
"#;

pub struct ChromiumBackend {
    kind: EngineKind,
    executable: Option<PathBuf>,
    headless: bool,
    suppress_automation: bool,
}

impl ChromiumBackend {
    pub fn primary(cfg: &SessionConfig) -> Self {
        Self {
            kind: EngineKind::Chromium,
            executable: cfg.chrome_executable.clone(),
            headless: cfg.headless,
            suppress_automation: cfg.suppress_automation,
        }
    }

    pub fn alternate(cfg: &SessionConfig) -> Self {
        Self {
            kind: EngineKind::AlternateBrowser,
            executable: cfg
                .alternate_executable
                .clone()
                .or_else(|| cfg.chrome_executable.clone()),
            headless: cfg.headless,
            suppress_automation: false,
        }
    }

    fn build_config(&self, spec: &SessionSpec) -> Result<BrowserConfig, String> {
        let fp = &spec.fingerprint;
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(fp.viewport_width, fp.viewport_height)
            .viewport(Viewport {
                width: fp.viewport_width,
                height: fp.viewport_height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: fp.viewport_width >= fp.viewport_height,
                has_touch: false,
            })
            .request_timeout(spec.timeout);

        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }

        let mut args = vec![
            format!("--user-agent={}", fp.user_agent),
            format!("--lang={}", fp.accept_language.split(',').next().unwrap_or("en-US")),
            "--no-first-run".to_string(),
            "--disable-gpu".to_string(),
        ];
        if self.suppress_automation {
            args.push("--disable-blink-features=AutomationControlled".to_string());
        }
        if let Some(lease) = &spec.proxy {
            // Chromium takes no credentials on the command line.
            if lease.has_credentials() {
                warn!(proxy = %lease, "Browser sessions cannot authenticate proxies, credentials ignored");
            }
            args.push(format!("--proxy-server={}", lease.server()));
        }
        builder = builder.args(args);

        builder.build()
    }
}

#[async_trait]
impl SessionBackend for ChromiumBackend {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn launch(&self, spec: &SessionSpec) -> Result<Box<dyn Session>, ScrapeError> {
        let init_err = |reason: String| ScrapeError::SessionInit {
            engine: self.kind.to_string(),
            reason,
        };

        let config = self.build_config(spec).map_err(init_err)?;
        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| init_err(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = match open_page(&browser, self.suppress_automation).await {
            Ok(page) => page,
            Err(reason) => {
                let _ = browser.close().await;
                handler_task.abort();
                return Err(init_err(reason));
            }
        };

        info!(
            site = %spec.site,
            engine = %self.kind,
            width = spec.fingerprint.viewport_width,
            height = spec.fingerprint.viewport_height,
            headless = self.headless,
            "Browser launched"
        );

        Ok(Box::new(BrowserSession {
            kind: self.kind,
            browser: Mutex::new(browser),
            page,
            handler_task: StdMutex::new(Some(handler_task)),
            timeout: spec.timeout,
        }))
    }
}

async fn open_page(browser: &Browser, stealth: bool) -> Result<Page, String> {
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| e.to_string())?;
    if stealth {
        let params = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(STEALTH_SCRIPT)
            .build()
            .map_err(|e| e.to_string())?;
        page.evaluate_on_new_document(params)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(page)
}

pub struct BrowserSession {
    kind: EngineKind,
    browser: Mutex<Browser>,
    page: Page,
    handler_task: StdMutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

#[async_trait]
impl Session for BrowserSession {
    fn engine(&self) -> EngineKind {
        self.kind
    }

    async fn fetch(&self, url: &str) -> Result<FetchedPage, ScrapeError> {
        let navigate = async {
            self.page
                .goto(url)
                .await
                .map_err(|e| ScrapeError::TransientNetwork(e.to_string()))?;
            self.page
                .content()
                .await
                .map_err(|e| ScrapeError::TransientNetwork(e.to_string()))
        };

        let body = tokio::time::timeout(self.timeout, navigate)
            .await
            .map_err(|_| ScrapeError::Timeout(self.timeout))??;

        // CDP navigation does not surface the HTTP status; blocks show up as
        // CAPTCHA pages and are caught by the scoped session.
        Ok(FetchedPage {
            url: url.to_string(),
            status: 200,
            body,
            engine: self.kind,
        })
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(err) = browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Err(err) = browser.wait().await {
            debug!(error = %err, "Browser process wait failed");
        }
        let handle = self
            .handler_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
