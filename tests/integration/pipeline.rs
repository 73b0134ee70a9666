//! End-to-end pipeline tests.
//!
//! Drive the real scanner, session facade, proxy pool, resolver,
//! convergence controller and stores against mock sites and engines.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use dealscout::engine::{ConvergenceController, Scanner, SiteEntry, SiteStatus};
use dealscout::error::ScrapeError;
use dealscout::market::{MarketPriceResolver, ResolverConfig};
use dealscout::proxy::{PoolSettings, ProxyPool, RotationStrategy};
use dealscout::session::{EngineKind, FacadeSettings, SessionBackend};
use dealscout::sites::{SearchQuery, SiteAdapter};
use dealscout::storage::{DealStore, JsonFileStore, SqliteStore};
use dealscout::types::PartialListing;

use crate::mock_site::{empty_pool, facade, fast_retry, MockBackend, MockSite};

fn entries(sites: Vec<Arc<MockSite>>) -> Vec<SiteEntry> {
    sites
        .into_iter()
        .map(|s| SiteEntry::new(s as Arc<dyn SiteAdapter>, SearchQuery::default()))
        .collect()
}

fn http_only() -> Vec<Arc<dyn SessionBackend>> {
    vec![Arc::new(MockBackend::new(EngineKind::Http))]
}

fn resolver() -> Arc<MarketPriceResolver> {
    Arc::new(MarketPriceResolver::new(ResolverConfig::default()))
}

fn proxied() -> FacadeSettings {
    FacadeSettings {
        use_proxy: true,
        direct_fallback: false,
        ..FacadeSettings::default()
    }
}

// ---------------------------------------------------------------------------
// Session fallback and proxies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fallback_reaches_plain_http() {
    let primary = Arc::new(MockBackend::failing(EngineKind::Chromium));
    let alternate = Arc::new(MockBackend::failing(EngineKind::AlternateBrowser));
    let http = Arc::new(MockBackend::new(EngineKind::Http));
    let backends: Vec<Arc<dyn SessionBackend>> = vec![primary.clone(), alternate.clone(), http.clone()];

    let site = Arc::new(
        MockSite::new("outlet")
            .browser_only()
            .with_listings(&[("Air Max 90", dec!(70), dec!(140))]),
    );
    let scanner = Scanner::new(
        entries(vec![site]),
        facade(backends, empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    assert_eq!(primary.launches(), 1);
    assert_eq!(alternate.launches(), 1);
    assert_eq!(http.launches(), 1);
    assert_eq!(outcome.report.sites[0].status, SiteStatus::Ok);
    assert_eq!(outcome.deals.len(), 1);
}

#[tokio::test]
async fn test_all_engines_failing_fails_only_that_site() {
    let broken: Vec<Arc<dyn SessionBackend>> = vec![
        Arc::new(MockBackend::failing(EngineKind::Chromium)),
        Arc::new(MockBackend::failing(EngineKind::Http)),
    ];
    let site = Arc::new(MockSite::new("outlet").with_listings(&[("Samba OG", dec!(50), dec!(100))]));
    let scanner = Scanner::new(
        entries(vec![site]),
        facade(broken, empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    let report = &outcome.report.sites[0];
    assert_eq!(report.status, SiteStatus::Failed);
    assert!(report.error.as_deref().unwrap().contains("session init failed"));
}

#[tokio::test]
async fn test_captcha_bans_proxy_and_retries_on_another() {
    let pool = Arc::new(ProxyPool::new(PoolSettings::default()));
    pool.add(["http://10.0.0.1:8080", "http://10.0.0.2:8080"]);
    let backend = Arc::new(MockBackend::new(EngineKind::Http).captcha_for("http-10.0.0.1-8080"));

    let site = Arc::new(MockSite::new("outlet").with_listings(&[("Gel Kayano", dec!(60), dec!(150))]));
    let scanner = Scanner::new(
        entries(vec![site.clone()]),
        facade(vec![backend.clone()], pool.clone(), proxied()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    let report = &outcome.report.sites[0];
    assert_eq!(report.status, SiteStatus::Ok);
    assert_eq!(report.proxy_retries, 1);
    assert_eq!(outcome.deals.len(), 1);

    let seen = backend.proxies_seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            Some("http-10.0.0.1-8080".to_string()),
            Some("http-10.0.0.2-8080".to_string())
        ]
    );
    assert_eq!(pool.available_count(), 1);
    let banned = pool.status().into_iter().find(|p| !p.available).unwrap();
    assert_eq!(banned.id, "http-10.0.0.1-8080");
}

#[tokio::test]
async fn test_forbidden_proxy_is_banned_and_site_retried_elsewhere() {
    let pool = Arc::new(ProxyPool::new(PoolSettings::default()));
    pool.add(["http://10.0.0.1:8080", "http://10.0.0.2:8080"]);
    let backend = Arc::new(MockBackend::new(EngineKind::Http).forbidden_for("http-10.0.0.1-8080"));
    let settings = FacadeSettings {
        strategy: RotationStrategy::PerformanceWeighted,
        ..proxied()
    };

    let site = Arc::new(MockSite::new("outlet").with_listings(&[("Gel Kayano", dec!(60), dec!(150))]));
    let scanner = Scanner::new(
        entries(vec![site.clone()]),
        facade(vec![backend.clone()], pool.clone(), settings),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    let report = &outcome.report.sites[0];
    assert_eq!(report.status, SiteStatus::Ok);
    assert_eq!(report.proxy_retries, 1);
    assert_eq!(site.searches(), 2);

    let seen = backend.proxies_seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            Some("http-10.0.0.1-8080".to_string()),
            Some("http-10.0.0.2-8080".to_string())
        ]
    );
    assert_eq!(pool.available_count(), 1);
}

#[tokio::test]
async fn test_no_proxy_skips_site() {
    let site = Arc::new(MockSite::new("outlet").with_listings(&[("Samba OG", dec!(50), dec!(100))]));
    let scanner = Scanner::new(
        entries(vec![site.clone()]),
        facade(http_only(), empty_pool(), proxied()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    assert_eq!(outcome.report.sites[0].status, SiteStatus::Skipped);
    assert_eq!(site.searches(), 0);
    assert!(outcome.deals.is_empty());
}

#[tokio::test]
async fn test_every_proxy_banned_skips_after_retry() {
    let pool = Arc::new(ProxyPool::new(PoolSettings::default()));
    pool.add(["http://10.0.0.1:8080"]);
    let backend = Arc::new(MockBackend::new(EngineKind::Http).captcha_for("http-10.0.0.1-8080"));
    let site = Arc::new(MockSite::new("outlet").with_listings(&[("Samba OG", dec!(50), dec!(100))]));
    let scanner = Scanner::new(
        entries(vec![site]),
        facade(vec![backend], pool.clone(), proxied()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    let report = &outcome.report.sites[0];
    assert_eq!(report.proxy_retries, 1);
    assert_eq!(report.status, SiteStatus::Skipped);
    assert_eq!(pool.available_count(), 0);
}

// ---------------------------------------------------------------------------
// Pass semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_market_prices_from_one_site_score_another() {
    let retail = Arc::new(MockSite::new("outlet").with_listings(&[
        ("Air Jordan 1 Retro High OG", dec!(120), dec!(180)),
        ("Plain Tee", dec!(10), dec!(20)),
    ]));
    let resale = Arc::new(MockSite::new("resale").with_market_price("Air Jordan 1 Retro High", dec!(300)));
    let scanner = Scanner::new(
        entries(vec![retail, resale]),
        facade(http_only(), empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    assert_eq!(outcome.deals.len(), 2);
    let top = &outcome.deals[0];
    assert_eq!(top.title, "Air Jordan 1 Retro High OG");
    assert_eq!(top.market_price(), Some(dec!(300)));
    assert_eq!(top.profit().profit_amount, dec!(180));
    assert!(top.is_profitable());
    assert_eq!(outcome.report.profitable, 1);
}

#[tokio::test]
async fn test_parse_failures_skip_items_not_the_pass() {
    let listing = |title: &str, url: Option<&str>| PartialListing {
        site: "outlet".into(),
        title: title.into(),
        url: url.map(String::from),
        brand: None,
        sku: None,
        price: None,
        original_price: None,
    };
    let site = Arc::new(MockSite::new("outlet").with_raw_listings(vec![
        listing("Good", Some("https://outlet.test/p/1")),
        listing("Broken", Some("https://outlet.test/p/broken")),
        listing("Nowhere", None),
    ]));
    let other = Arc::new(MockSite::new("other").with_listings(&[("Dunk Low", dec!(60), dec!(110))]));
    let scanner = Scanner::new(
        entries(vec![site, other]),
        facade(http_only(), empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    let outlet = &outcome.report.sites[0];
    assert_eq!(outlet.status, SiteStatus::Partial);
    assert_eq!(outlet.parse_skips, 2);
    assert_eq!(outlet.deals, 1);
    assert_eq!(outcome.report.sites[1].status, SiteStatus::Ok);
    assert_eq!(outcome.deals.len(), 2);
}

#[tokio::test]
async fn test_transient_errors_exhaust_retries_then_fail_site() {
    let site = Arc::new(MockSite::new("flaky"));
    site.set_error(|| ScrapeError::Timeout(Duration::from_secs(30)));
    let scanner = Scanner::new(
        entries(vec![site.clone()]),
        facade(http_only(), empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    assert_eq!(site.searches(), 2);
    assert_eq!(outcome.report.failed(), 1);
}

#[tokio::test]
async fn test_parallel_workers_scan_every_site() {
    let sites: Vec<Arc<MockSite>> = (0..8)
        .map(|i| {
            let title = format!("Runner {i}");
            Arc::new(MockSite::new(&format!("site{i}")).with_listings(&[(title.as_str(), dec!(50), dec!(100))]))
        })
        .collect();
    let pool = Arc::new(ProxyPool::new(PoolSettings::default()));
    pool.add(["http://10.0.0.1:8080", "http://10.0.0.2:8080", "http://10.0.0.3:8080"]);
    let scanner = Scanner::new(
        entries(sites.clone()),
        facade(http_only(), pool.clone(), proxied()),
        fast_retry(),
        resolver(),
    )
    .with_concurrency(4);

    let outcome = scanner.scan_pass(1, "run", &CancellationToken::new()).await;
    assert_eq!(outcome.deals.len(), 8);
    assert_eq!(outcome.report.succeeded(), 8);
    assert!(sites.iter().all(|s| s.searches() == 1));
    assert_eq!(pool.available_count(), 3);
    let samples: u64 = pool.status().iter().map(|p| p.samples).sum();
    assert_eq!(samples, 8);
}

// ---------------------------------------------------------------------------
// Convergence and persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_controller_converges_through_scanner() {
    let site = Arc::new(MockSite::new("outlet").with_passes(&[
        &[("Shoe A", dec!(50), dec!(100)), ("Shoe B", dec!(60), dec!(100))],
        &[("Shoe A", dec!(45), dec!(100)), ("Shoe B", dec!(60), dec!(100))],
    ]));
    let scanner = Scanner::new(
        entries(vec![site.clone()]),
        facade(http_only(), empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );

    let run = ConvergenceController::new(5, Duration::ZERO)
        .run(&scanner, &CancellationToken::new())
        .await;
    assert_eq!(run.iterations, 2);
    assert!(run.converged);
    assert_eq!(site.searches(), 2);
    assert_eq!(run.deals.len(), 2);
    // last-seen price wins
    let a = run.deals.iter().find(|d| d.title == "Shoe A").unwrap();
    assert_eq!(a.price, dec!(45));
}

#[tokio::test]
async fn test_controller_respects_iteration_cap() {
    let site = Arc::new(MockSite::new("outlet").with_passes(&[
        &[("Shoe A", dec!(50), dec!(100))],
        &[("Shoe B", dec!(50), dec!(100))],
        &[("Shoe C", dec!(50), dec!(100))],
        &[("Shoe D", dec!(50), dec!(100))],
    ]));
    let scanner = Scanner::new(
        entries(vec![site.clone()]),
        facade(http_only(), empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );

    let run = ConvergenceController::new(3, Duration::ZERO)
        .run(&scanner, &CancellationToken::new())
        .await;
    assert_eq!(run.iterations, 3);
    assert!(!run.converged);
    assert_eq!(run.deals.len(), 3);
}

#[tokio::test]
async fn test_saving_a_run_twice_is_idempotent() {
    let site = Arc::new(MockSite::new("outlet").with_passes(&[
        &[("Shoe A", dec!(50), dec!(100))],
        &[("Shoe A", dec!(40), dec!(100))],
    ]));
    let scanner = Scanner::new(
        entries(vec![site]),
        facade(http_only(), empty_pool(), FacadeSettings::default()),
        fast_retry(),
        resolver(),
    );
    let controller = ConvergenceController::single_pass();
    let stores: Vec<Arc<dyn DealStore>> = vec![
        Arc::new(JsonFileStore::in_memory()),
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap()),
    ];

    let first = controller.run(&scanner, &CancellationToken::new()).await;
    let second = controller.run(&scanner, &CancellationToken::new()).await;
    for store in &stores {
        store.save(&first.deals).await.unwrap();
        store.save(&second.deals).await.unwrap();
        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].price, dec!(40));
    }
}
