//! SQLite deal store.
//!
//! Scalar columns are kept for ad-hoc queries; the full deal lives in
//! `payload` as JSON so schema changes to `Deal` need no migration.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use super::{merge, DealStore, SaveReport};
use crate::error::StorageError;
use crate::market::profit;
use crate::types::Deal;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS deals (
    unique_key     TEXT PRIMARY KEY,
    site           TEXT NOT NULL,
    title          TEXT NOT NULL,
    price          TEXT NOT NULL,
    market_price   TEXT,
    profit_amount  TEXT NOT NULL,
    is_profitable  INTEGER NOT NULL,
    payload        TEXT NOT NULL,
    first_seen     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
)";

const UPSERT: &str = "
INSERT INTO deals (unique_key, site, title, price, market_price, profit_amount,
                   is_profitable, payload, first_seen, updated_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(unique_key) DO UPDATE SET
    site = excluded.site,
    title = excluded.title,
    price = excluded.price,
    market_price = excluded.market_price,
    profit_amount = excluded.profit_amount,
    is_profitable = excluded.is_profitable,
    payload = excluded.payload,
    updated_at = excluded.updated_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Open from a connection URL such as `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // An in-memory database lives only as long as its one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DealStore for SqliteStore {
    async fn save(&self, deals: &[Deal]) -> Result<SaveReport, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut report = SaveReport::default();
        let now = Utc::now().to_rfc3339();

        for deal in deals {
            let key = deal.unique_key();
            let existing: Option<String> =
                sqlx::query_scalar("SELECT payload FROM deals WHERE unique_key = ?")
                    .bind(&key)
                    .fetch_optional(&mut *tx)
                    .await?;

            let record = match existing {
                Some(payload) => {
                    let mut stored: Deal = serde_json::from_str(&payload)?;
                    merge(&mut stored, deal);
                    report.updated += 1;
                    stored
                }
                None => {
                    report.inserted += 1;
                    deal.clone()
                }
            };

            let profit = record.profit();
            sqlx::query(UPSERT)
                .bind(&key)
                .bind(&record.site)
                .bind(&record.title)
                .bind(record.price.to_string())
                .bind(record.market_price().map(|p| p.to_string()))
                .bind(profit.profit_amount.to_string())
                .bind(profit.is_profitable)
                .bind(serde_json::to_string(&record)?)
                .bind(record.discovered_at.to_rfc3339())
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(inserted = report.inserted, updated = report.updated, "Deals upserted");
        Ok(report)
    }

    async fn all(&self) -> Result<Vec<Deal>, StorageError> {
        let payloads: Vec<String> = sqlx::query_scalar("SELECT payload FROM deals")
            .fetch_all(&self.pool)
            .await?;
        let deals = payloads
            .iter()
            .map(|p| serde_json::from_str(p))
            .collect::<Result<Vec<Deal>, _>>()?;
        Ok(profit::rank(deals))
    }
}
