//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::report::PassReport;
use crate::proxy::{ProxyPool, ProxyStatus};
use crate::types::Deal;

/// Pass reports kept for `/api/passes`.
const MAX_PASSES: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub deals: RwLock<Vec<Deal>>,
    pub passes: RwLock<Vec<PassReport>>,
    pub pool: Arc<ProxyPool>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        Self {
            deals: RwLock::new(Vec::new()),
            passes: RwLock::new(Vec::new()),
            pool,
            started_at: Utc::now(),
        }
    }

    /// Replace the deal set shown by `/api/deals`.
    pub async fn set_deals(&self, deals: Vec<Deal>) {
        *self.deals.write().await = deals;
    }

    pub async fn record_passes(&self, reports: &[PassReport]) {
        let mut passes = self.passes.write().await;
        passes.extend_from_slice(reports);
        let excess = passes.len().saturating_sub(MAX_PASSES);
        passes.drain(..excess);
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_secs: i64,
    pub passes_run: usize,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub deals: usize,
    pub profitable: usize,
    pub proxies_total: usize,
    pub proxies_available: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct DealsQuery {
    #[serde(default)]
    pub profitable: bool,
    pub site: Option<String>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

pub type AppState = Arc<DashboardState>;

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let deals = state.deals.read().await;
    let passes = state.passes.read().await;

    Json(StatusResponse {
        status: "RUNNING".to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        passes_run: passes.len(),
        last_pass_at: passes.last().map(|p| p.finished_at),
        deals: deals.len(),
        profitable: deals.iter().filter(|d| d.is_profitable()).count(),
        proxies_total: state.pool.len(),
        proxies_available: state.pool.available_count(),
    })
}

/// GET /api/deals?profitable=true&site=name
pub async fn get_deals(
    State(state): State<AppState>,
    Query(query): Query<DealsQuery>,
) -> Json<Vec<Deal>> {
    let deals = state.deals.read().await;
    let selected = deals
        .iter()
        .filter(|d| !query.profitable || d.is_profitable())
        .filter(|d| query.site.as_deref().map_or(true, |s| d.site == s))
        .cloned()
        .collect();
    Json(selected)
}

/// GET /api/passes
pub async fn get_passes(State(state): State<AppState>) -> Json<Vec<PassReport>> {
    Json(state.passes.read().await.clone())
}

/// GET /api/proxies
pub async fn get_proxies(State(state): State<AppState>) -> Json<Vec<ProxyStatus>> {
    Json(state.pool.status())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
