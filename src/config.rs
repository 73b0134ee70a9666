//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults so a partial file (or none at all in tests) works.
//! Secrets such as the alert webhook URL are referenced by env-var name and
//! resolved at runtime.

use anyhow::{bail, Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::market::profit::DEFAULT_PROFIT_THRESHOLD;
use crate::proxy::RotationStrategy;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub proxy: ProxyConfig,
    pub pacing: PacingConfig,
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub dashboard: DashboardConfig,
    pub alerts: AlertsConfig,
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum profit percentage for a deal to count as profitable.
    pub profit_threshold: f64,
    /// Title similarity (0..=1) needed for a fuzzy market-price match.
    pub fuzzy_match_threshold: f64,
    pub max_iterations: u32,
    pub iteration_cooldown_secs: u64,
    /// 1 scans sites sequentially; more enables the bounded worker set.
    pub max_concurrent_sites: usize,
    pub min_discount_percent: f64,
    /// Case-insensitive brand allow-list. Empty keeps every brand.
    pub brands: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profit_threshold: 20.0,
            fuzzy_match_threshold: 0.8,
            max_iterations: 5,
            iteration_cooldown_secs: 60,
            max_concurrent_sites: 1,
            min_discount_percent: 0.0,
            brands: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn profit_threshold(&self) -> Decimal {
        Decimal::from_f64(self.profit_threshold).unwrap_or(DEFAULT_PROFIT_THRESHOLD)
    }

    pub fn min_discount(&self) -> Decimal {
        Decimal::from_f64(self.min_discount_percent).unwrap_or(Decimal::ZERO)
    }

    pub fn iteration_cooldown(&self) -> Duration {
        Duration::from_secs(self.iteration_cooldown_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    pub use_proxy: bool,
    /// Go out directly when no proxy is available instead of skipping the site.
    pub direct_fallback: bool,
    /// Line-format list or `.json` snapshot.
    pub list_path: Option<PathBuf>,
    pub max_fails: u32,
    pub ban_time_secs: u64,
    pub rotation_strategy: RotationStrategy,
    pub fetch_free: bool,
    /// Snapshot path written on shutdown.
    pub save_on_exit: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            use_proxy: false,
            direct_fallback: true,
            list_path: None,
            max_fails: 3,
            ban_time_secs: 1800,
            rotation_strategy: RotationStrategy::RoundRobin,
            fetch_free: false,
            save_on_exit: None,
        }
    }
}

impl ProxyConfig {
    pub fn ban_time(&self) -> Duration {
        Duration::from_secs(self.ban_time_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PacingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1000,
            max_delay_ms: 3000,
            max_retries: 3,
            retry_base_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub rotate_user_agent: bool,
    /// Hide `navigator.webdriver` and friends in browser sessions.
    pub suppress_automation: bool,
    pub captcha_detection: bool,
    pub request_timeout_secs: u64,
    /// When false only the plain HTTP session is used.
    pub enable_browser: bool,
    pub chrome_executable: Option<PathBuf>,
    pub alternate_executable: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport_width: 1920,
            viewport_height: 1080,
            rotate_user_agent: true,
            suppress_automation: true,
            captcha_detection: true,
            request_timeout_secs: 30,
            enable_browser: true,
            chrome_executable: None,
            alternate_executable: None,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub continuous: bool,
    /// Run the convergence loop instead of a single pass per scan.
    pub iterate: bool,
    pub scan_interval_secs: u64,
    pub report_interval_secs: u64,
    pub idle_tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            iterate: false,
            scan_interval_secs: 1800,
            report_interval_secs: 3600,
            idle_tick_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Json,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// File path for `json`, database file for `sqlite`.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Json,
            path: "deals.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8080,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AlertsConfig {
    pub webhook_url_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    pub name: String,
    /// Search endpoint; `{keywords}` and `{category}` are substituted.
    pub search_url: String,
    #[serde(default)]
    pub market_prices_url: Option<String>,
    #[serde(default)]
    pub keywords: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Prefer a browser session for this site.
    #[serde(default)]
    pub browser: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the engine misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.pacing.min_delay_ms > self.pacing.max_delay_ms {
            bail!(
                "pacing.min_delay_ms ({}) exceeds pacing.max_delay_ms ({})",
                self.pacing.min_delay_ms,
                self.pacing.max_delay_ms
            );
        }
        if self.engine.max_iterations == 0 {
            bail!("engine.max_iterations must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.engine.fuzzy_match_threshold) {
            bail!(
                "engine.fuzzy_match_threshold must be within [0, 1], got {}",
                self.engine.fuzzy_match_threshold
            );
        }
        if self.engine.max_concurrent_sites == 0 {
            bail!("engine.max_concurrent_sites must be at least 1");
        }
        if self.proxy.max_fails == 0 {
            bail!("proxy.max_fails must be at least 1");
        }

        let mut seen = HashSet::new();
        for site in &self.sites {
            if !seen.insert(site.name.as_str()) {
                bail!("duplicate site name: {}", site.name);
            }
        }
        Ok(())
    }

    pub fn enabled_sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().filter(|s| s.enabled)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
