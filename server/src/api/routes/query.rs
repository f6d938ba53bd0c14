//! Read-side query endpoints
//!
//! Aggregated usage overview plus raw series access. All handlers are pure
//! reads over the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::types::{ApiError, parse_timestamp_param};
use crate::core::constants::DEFAULT_SERIES_QUERY_LIMIT;
use crate::domain::budget::{BudgetMonitor, BudgetStatus};
use crate::domain::fleet::{FleetAggregator, NodeInfo};
use crate::store::{GroupBy, MetricCategory, MetricRecord, MetricStore, RecordFilter, TimeRange};

#[derive(Clone)]
pub struct QueryState {
    pub store: Arc<MetricStore>,
    pub budget: Arc<BudgetMonitor>,
    pub fleet: Arc<FleetAggregator>,
}

pub fn routes(
    store: Arc<MetricStore>,
    budget: Arc<BudgetMonitor>,
    fleet: Arc<FleetAggregator>,
) -> Router<()> {
    Router::new()
        .route("/overview", get(overview))
        .route("/series/{category}", get(series))
        .route("/budget", get(budget_status))
        .route("/fleet/nodes", get(fleet_nodes))
        .with_state(QueryState {
            store,
            budget,
            fleet,
        })
}

// =============================================================================
// Overview
// =============================================================================

#[derive(Debug, Serialize)]
pub struct WindowTotals {
    pub tokens: f64,
    pub cost_usd: f64,
}

#[derive(Debug, Serialize)]
pub struct OverviewResponse {
    pub today: WindowTotals,
    pub last_7_days: WindowTotals,
    pub last_30_days: WindowTotals,
    /// Cost per UTC day over the retention window, oldest first
    pub daily_cost: BTreeMap<String, f64>,
    /// Token totals keyed by model attribute
    pub tokens_by_model: BTreeMap<String, f64>,
    pub avg_run_duration_ms: Option<f64>,
    pub last_received: Option<DateTime<Utc>>,
}

fn window_totals(store: &MetricStore, range: TimeRange) -> WindowTotals {
    WindowTotals {
        tokens: store.sum(MetricCategory::TokenUsage, range),
        cost_usd: store.sum(MetricCategory::Cost, range),
    }
}

async fn overview(State(state): State<QueryState>) -> Json<OverviewResponse> {
    let now = Utc::now();
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();

    let daily_cost = state
        .store
        .aggregate(MetricCategory::Cost, TimeRange::all(), GroupBy::Day)
        .into_iter()
        .map(|(day, bucket)| (day, bucket.sum))
        .collect();

    let tokens_by_model = state
        .store
        .aggregate(
            MetricCategory::TokenUsage,
            TimeRange::all(),
            GroupBy::Attribute("model".to_string()),
        )
        .into_iter()
        .map(|(model, bucket)| (model, bucket.sum))
        .collect();

    let runs: Vec<MetricRecord> = state.store.query(
        MetricCategory::SessionEvent,
        TimeRange::all(),
        &RecordFilter {
            attr: Some(("event".to_string(), "run".to_string())),
            ..Default::default()
        },
    );
    let avg_run_duration_ms = if runs.is_empty() {
        None
    } else {
        Some(runs.iter().map(|r| r.value).sum::<f64>() / runs.len() as f64)
    };

    Json(OverviewResponse {
        today: window_totals(&state.store, TimeRange::since(midnight)),
        last_7_days: window_totals(&state.store, TimeRange::since(now - Duration::days(7))),
        last_30_days: window_totals(&state.store, TimeRange::since(now - Duration::days(30))),
        daily_cost,
        tokens_by_model,
        avg_run_duration_ms,
        last_received: state.store.last_received(),
    })
}

// =============================================================================
// Series
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SeriesParams {
    pub start: Option<String>,
    pub end: Option<String>,
    /// Restrict to one source node
    pub node: Option<String>,
    /// Attribute equality filter as `key:value`
    pub attr: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub category: MetricCategory,
    pub count: usize,
    pub records: Vec<MetricRecord>,
}

async fn series(
    State(state): State<QueryState>,
    Path(category): Path<String>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let category = MetricCategory::parse(&category).ok_or_else(|| {
        ApiError::not_found(
            "UNKNOWN_CATEGORY",
            format!("Unknown metric category: {}", category),
        )
    })?;

    let start = parse_timestamp_param(&params.start)?;
    let end = parse_timestamp_param(&params.end)?;
    let range = TimeRange { start, end };

    let attr = match &params.attr {
        Some(raw) => {
            let (key, value) = raw.split_once(':').ok_or_else(|| {
                ApiError::bad_request("INVALID_ATTR_FILTER", "Use attr=key:value")
            })?;
            Some((key.to_string(), value.to_string()))
        }
        None => None,
    };
    let filter = RecordFilter {
        source_node_id: params.node.clone(),
        attr,
    };

    let limit = params.limit.unwrap_or(DEFAULT_SERIES_QUERY_LIMIT);
    let mut records = state.store.query(category, range, &filter);
    // Newest records win when the result is truncated
    if records.len() > limit {
        records.drain(..records.len() - limit);
    }

    Ok(Json(SeriesResponse {
        category,
        count: records.len(),
        records,
    }))
}

// =============================================================================
// Budget and fleet
// =============================================================================

async fn budget_status(
    State(state): State<QueryState>,
) -> Result<Json<BudgetStatus>, ApiError> {
    state
        .budget
        .status(Utc::now())
        .map(Json)
        .ok_or_else(|| ApiError::not_found("NO_BUDGET", "No budget is configured"))
}

async fn fleet_nodes(State(state): State<QueryState>) -> Json<Vec<NodeInfo>> {
    Json(state.fleet.nodes())
}
