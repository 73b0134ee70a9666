//! Persistence Gateway.
//!
//! Deals are upserted by their unique key: saving the same listing twice
//! leaves one record carrying the latest price fields. Two stores are
//! provided, a JSON file (the default) and SQLite.

pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;
use crate::market::profit;
use crate::types::Deal;

pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Gateway contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    JsonLines,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "jsonl" | "ndjson" => Ok(ExportFormat::JsonLines),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(StorageError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportFormat::Json => "json",
            ExportFormat::JsonLines => "jsonl",
            ExportFormat::Csv => "csv",
        };
        f.write_str(s)
    }
}

/// What one `save` call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveReport {
    pub inserted: usize,
    pub updated: usize,
}

#[async_trait]
pub trait DealStore: Send + Sync {
    /// Upsert `deals` keyed by `Deal::unique_key`.
    async fn save(&self, deals: &[Deal]) -> Result<SaveReport, StorageError>;

    /// Every stored deal, ranked by profit.
    async fn all(&self) -> Result<Vec<Deal>, StorageError>;

    async fn export(&self, format: ExportFormat) -> Result<String, StorageError> {
        let deals = self.all().await?;
        export_deals(&deals, format)
    }
}

/// Open the store selected by configuration.
pub async fn open_store(cfg: &StorageConfig) -> Result<Arc<dyn DealStore>, StorageError> {
    let store: Arc<dyn DealStore> = match cfg.backend {
        StorageBackend::Json => Arc::new(JsonFileStore::open(&cfg.path).await?),
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(Path::new(&cfg.path)).await?),
    };
    info!(backend = ?cfg.backend, path = %cfg.path, "Deal store ready");
    Ok(store)
}

/// Replace the stored record with the newer observation, keeping the first
/// discovery time.
fn merge(existing: &mut Deal, latest: &Deal) {
    let first_seen = existing.discovered_at.min(latest.discovered_at);
    *existing = latest.clone();
    existing.discovered_at = first_seen;
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// Keeps every deal in memory and rewrites the whole file after each save.
pub struct JsonFileStore {
    path: Option<PathBuf>,
    deals: Mutex<BTreeMap<String, Deal>>,
}

impl JsonFileStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            deals: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open `path`, loading existing deals. A missing file starts empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut deals = BTreeMap::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(json) if !json.trim().is_empty() => {
                let stored: Vec<Deal> = serde_json::from_str(&json)?;
                for deal in stored {
                    deals.insert(deal.unique_key(), deal);
                }
                info!(path = %path.display(), deals = deals.len(), "Deal store loaded from disk");
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No saved deals found, starting fresh");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path: Some(path),
            deals: Mutex::new(deals),
        })
    }

    pub async fn len(&self) -> usize {
        self.deals.lock().await.len()
    }

    async fn persist(&self, deals: &BTreeMap<String, Deal>) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let ranked = profit::rank(deals.values().cloned().collect());
        let json = serde_json::to_string_pretty(&ranked)?;

        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), deals = ranked.len(), "Deals saved");
        Ok(())
    }
}

#[async_trait]
impl DealStore for JsonFileStore {
    async fn save(&self, deals: &[Deal]) -> Result<SaveReport, StorageError> {
        let mut stored = self.deals.lock().await;
        let mut report = SaveReport::default();
        for deal in deals {
            match stored.get_mut(&deal.unique_key()) {
                Some(existing) => {
                    merge(existing, deal);
                    report.updated += 1;
                }
                None => {
                    stored.insert(deal.unique_key(), deal.clone());
                    report.inserted += 1;
                }
            }
        }
        self.persist(&stored).await?;
        Ok(report)
    }

    async fn all(&self) -> Result<Vec<Deal>, StorageError> {
        let stored = self.deals.lock().await;
        Ok(profit::rank(stored.values().cloned().collect()))
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

const CSV_HEADER: &str = "site,title,brand,sku,price,original_price,discount_percent,\
market_price,profit_amount,profit_percentage,is_profitable,url,discovered_at";

pub fn export_deals(deals: &[Deal], format: ExportFormat) -> Result<String, StorageError> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(deals)?),
        ExportFormat::JsonLines => {
            let mut out = String::new();
            for deal in deals {
                out.push_str(&serde_json::to_string(deal)?);
                out.push('\n');
            }
            Ok(out)
        }
        ExportFormat::Csv => Ok(to_csv(deals)),
    }
}

fn to_csv(deals: &[Deal]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for deal in deals {
        let profit = deal.profit();
        let fields = [
            deal.site.clone(),
            deal.title.clone(),
            deal.brand.clone().unwrap_or_default(),
            deal.sku.clone().unwrap_or_default(),
            deal.price.to_string(),
            deal.original_price.to_string(),
            deal.discount_percent.to_string(),
            deal.market_price().map(|p| p.to_string()).unwrap_or_default(),
            profit.profit_amount.to_string(),
            profit.profit_percentage.to_string(),
            profit.is_profitable.to_string(),
            deal.url.clone().unwrap_or_default(),
            deal.discovered_at.to_rfc3339(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
