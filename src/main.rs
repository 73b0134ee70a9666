//! DEALSCOUT: multi-site discount scanner
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the proxy pool, session facade and site adapters, then runs
//! either one convergence run or the continuous scheduler with graceful
//! shutdown on Ctrl+C.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dealscout::config::AppConfig;
use dealscout::dashboard::{self, DashboardState};
use dealscout::engine::{ConvergenceController, DealFilter, RunSummary, Scanner, Scheduler, SiteEntry};
use dealscout::market::{MarketPriceResolver, ResolverConfig};
use dealscout::notify::{LogNotifier, Notifier, ReportSummary, WebhookNotifier};
use dealscout::pacing::{RateLimiter, RetryPolicy};
use dealscout::proxy::ProxyPool;
use dealscout::session::{FacadeSettings, SessionFacade};
use dealscout::sites::{JsonFeedAdapter, SiteAdapter};
use dealscout::storage::{self, DealStore};

const BANNER: &str = r#"
 ____  _____    _    _     ____   ____ ___  _   _ _____
|  _ \| ____|  / \  | |   / ___| / ___/ _ \| | | |_   _|
| | | |  _|   / _ \ | |   \___ \| |  | | | | | | | | |
| |_| | |___ / ___ \| |___ ___) | |__| |_| | |_| | | |
|____/|_____/_/   \_\_____|____/ \____\___/ \___/  |_|

  Multi-site discount scanner
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("DEALSCOUT_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        config = %config_path,
        sites = cfg.enabled_sites().count(),
        use_proxy = cfg.proxy.use_proxy,
        continuous = cfg.scheduler.continuous,
        "DEALSCOUT starting up"
    );

    // -- Proxy pool ------------------------------------------------------

    let pool = Arc::new(ProxyPool::initialize(&cfg.proxy).context("Failed to initialise proxy pool")?);
    if cfg.proxy.fetch_free {
        let report = pool.fetch_free().await;
        info!(added = report.added, duplicates = report.duplicates, "Public proxy lists fetched");
    }
    if cfg.proxy.use_proxy && pool.is_empty() && !cfg.proxy.direct_fallback {
        warn!("Proxies required but the pool is empty; every site will be skipped");
    }

    // -- Components ------------------------------------------------------

    let limiter = Arc::new(RateLimiter::from_config(&cfg.pacing));
    let facade = Arc::new(SessionFacade::new(
        SessionFacade::default_backends(&cfg.session),
        pool.clone(),
        limiter,
        FacadeSettings::from_config(&cfg.session, &cfg.proxy),
    ));
    let resolver = Arc::new(MarketPriceResolver::new(ResolverConfig {
        profit_threshold: cfg.engine.profit_threshold(),
        fuzzy_threshold: cfg.engine.fuzzy_match_threshold,
    }));

    let sites: Vec<SiteEntry> = cfg
        .enabled_sites()
        .map(|site| {
            let adapter: Arc<dyn SiteAdapter> = Arc::new(JsonFeedAdapter::from_config(site));
            SiteEntry::from_config(adapter, site)
        })
        .collect();
    if sites.is_empty() {
        warn!("No sites enabled in configuration");
    }

    let scanner = Scanner::new(sites, facade, RetryPolicy::from_config(&cfg.pacing), resolver)
        .with_filter(DealFilter::from_config(&cfg.engine))
        .with_concurrency(cfg.engine.max_concurrent_sites);

    let store = storage::open_store(&cfg.storage)
        .await
        .context("Failed to open deal store")?;
    let notifiers = build_notifiers(&cfg);

    let dashboard_state = if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(pool.clone()));
        dashboard::spawn_dashboard(state.clone(), cfg.dashboard.port);
        Some(state)
    } else {
        None
    };

    // -- Shutdown signal -------------------------------------------------

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    // -- Run -------------------------------------------------------------

    if cfg.scheduler.continuous {
        let controller = if cfg.scheduler.iterate {
            ConvergenceController::from_config(&cfg.engine)
        } else {
            ConvergenceController::single_pass()
        };
        let mut scheduler = Scheduler::new(&cfg.scheduler, controller, store).with_notifiers(notifiers);
        if let Some(state) = dashboard_state {
            scheduler = scheduler.with_dashboard(state);
        }
        info!(
            scan_interval_secs = cfg.scheduler.scan_interval_secs,
            "Entering continuous mode. Press Ctrl+C to stop."
        );
        let stats = scheduler.run(&scanner, &cancel).await;
        info!(scans = stats.scans, reports = stats.reports, "Continuous mode finished");
    } else {
        let controller = ConvergenceController::from_config(&cfg.engine);
        let run = controller.run(&scanner, &cancel).await;
        finish_run(&run, store.as_ref(), &notifiers).await;
        if let Some(state) = dashboard_state {
            state.record_passes(&run.passes).await;
            state.set_deals(run.deals.clone()).await;
        }
    }

    if let Some(path) = &cfg.proxy.save_on_exit {
        save_proxy_snapshot(&pool, path);
    }

    info!("DEALSCOUT shut down cleanly.");
    Ok(())
}

/// Persist and report the deals of a one-shot run.
async fn finish_run(run: &RunSummary, store: &dyn DealStore, notifiers: &[Arc<dyn Notifier>]) {
    log_run_summary(run);

    match store.save(&run.deals).await {
        Ok(report) => info!(inserted = report.inserted, updated = report.updated, "Deals saved"),
        Err(e) => error!(error = %e, "Failed to save deals"),
    }

    let summary = ReportSummary::from_run(run);
    for notifier in notifiers {
        if let Err(e) = notifier.notify(&run.deals, &summary).await {
            warn!(error = %e, "Notification failed");
        }
    }
}

fn build_notifiers(cfg: &AppConfig) -> Vec<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(env) = cfg.alerts.webhook_url_env.as_deref() {
        match AppConfig::resolve_env(env) {
            Ok(url) => {
                info!(env, "Webhook notifier enabled");
                notifiers.push(Arc::new(WebhookNotifier::new(url)));
            }
            Err(e) => warn!(error = %e, "Webhook notifier disabled"),
        }
    }
    notifiers
}

fn save_proxy_snapshot(pool: &ProxyPool, path: &Path) {
    match pool.save(path) {
        Ok(()) => info!(path = %path.display(), proxies = pool.len(), "Proxy pool snapshot saved"),
        Err(e) => error!(path = %path.display(), error = %e, "Failed to save proxy pool snapshot"),
    }
}

/// Log a human-readable run summary.
fn log_run_summary(run: &RunSummary) {
    info!(
        run_id = %run.run_id,
        iterations = run.iterations,
        converged = run.converged,
        cancelled = run.cancelled,
        deals = run.deals.len(),
        profitable = run.profitable().count(),
        "Run complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dealscout=info"));

    let json_logging = std::env::var("DEALSCOUT_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
