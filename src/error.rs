//! Error taxonomy for the deal-discovery engine.
//!
//! Failures are explicit values so callers decide per class what to do:
//! transient errors are retried, parse errors skip one item, proxy bans
//! rotate the egress proxy, session-init errors walk the engine fallback
//! chain. Nothing in the scan path panics or aborts a pass.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Scrape errors
// ---------------------------------------------------------------------------

/// Coarse failure class used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Transient,
    Parse,
    Permanent,
    ProxyBan,
    SessionInit,
    NoProxy,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Parse => "parse",
            ErrorKind::Permanent => "permanent",
            ErrorKind::ProxyBan => "proxy-ban",
            ErrorKind::SessionInit => "session-init",
            ErrorKind::NoProxy => "no-proxy",
        };
        f.write_str(s)
    }
}

/// Errors raised while talking to a retail or market-price site.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("could not parse response: {0}")]
    Parse(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("blocked by site: {0}")]
    ProxyBan(String),

    #[error("CAPTCHA detected ({kind})")]
    Captcha { kind: String },

    #[error("session init failed for {engine}: {reason}")]
    SessionInit { engine: String, reason: String },

    #[error("no proxy available and direct fallback disabled")]
    NoProxy,
}

impl ScrapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScrapeError::TransientNetwork(_)
            | ScrapeError::Timeout(_)
            | ScrapeError::RateLimited { .. } => ErrorKind::Transient,
            ScrapeError::Parse(_) => ErrorKind::Parse,
            ScrapeError::Permanent(_) => ErrorKind::Permanent,
            ScrapeError::ProxyBan(_) | ScrapeError::Captcha { .. } => ErrorKind::ProxyBan,
            ScrapeError::SessionInit { .. } => ErrorKind::SessionInit,
            ScrapeError::NoProxy => ErrorKind::NoProxy,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether the egress identity was flagged and should be rotated.
    pub fn is_proxy_ban(&self) -> bool {
        self.kind() == ErrorKind::ProxyBan
    }

    /// Classify a non-success HTTP status.
    ///
    /// 429 and 5xx are transient, 403 means the current egress identity is
    /// blocked, every other 4xx is permanent.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            429 => ScrapeError::RateLimited { status },
            403 => ScrapeError::ProxyBan(format!("HTTP 403 from {context}")),
            500..=599 => ScrapeError::TransientNetwork(format!("HTTP {status} from {context}")),
            _ => ScrapeError::Permanent(format!("HTTP {status} from {context}")),
        }
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let context = err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "request".to_string());
            return ScrapeError::from_status(status.as_u16(), &context);
        }
        if err.is_decode() {
            return ScrapeError::Parse(err.to_string());
        }
        if err.is_builder() {
            return ScrapeError::Permanent(err.to_string());
        }
        // timeouts, connect failures, resets, proxy tunnel errors
        ScrapeError::TransientNetwork(err.to_string())
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(err: serde_json::Error) -> Self {
        ScrapeError::Parse(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Startup / gateway errors
// ---------------------------------------------------------------------------

/// Fatal configuration problems. Only produced while starting up.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed proxy list {path} at line {line}: {reason}")]
    MalformedProxyLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("malformed proxy snapshot {path}: {source}")]
    MalformedSnapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Persistence Gateway failures. Logged and reported, never fatal to a pass.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),
}

/// Notifier failures. Logged, never fatal to the scan loop.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification rejected with HTTP {status}")]
    Rejected { status: u16 },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
