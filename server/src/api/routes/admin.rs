//! Runtime administration: budget reconfiguration and fleet endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::routes::ingest::IngestGate;
use crate::api::types::ApiError;
use crate::domain::budget::{BudgetConfig, BudgetMonitor};
use crate::domain::fleet::{FleetAggregator, NodeReport, SubmitOutcome};

/// Header carrying the fleet shared key on register/report calls.
pub const FLEET_KEY_HEADER: &str = "x-agentscope-fleet-key";

#[derive(Clone)]
pub struct AdminState {
    pub budget: Arc<BudgetMonitor>,
    pub gate: Arc<IngestGate>,
}

pub fn budget_routes(budget: Arc<BudgetMonitor>, gate: Arc<IngestGate>) -> Router<()> {
    let state = AdminState { budget, gate };
    Router::new()
        .route("/budget", post(replace_budget))
        .with_state(state)
}

pub fn fleet_routes(fleet: Arc<FleetAggregator>) -> Router<()> {
    Router::new()
        .route("/fleet/register", post(fleet_register))
        .route("/fleet/report", post(fleet_report))
        .with_state(fleet)
}

/// POST /api/v1/budget - replace the budget configuration.
///
/// Replacing the config starts a fresh alert cycle and lifts any
/// ingestion pause the previous budget triggered.
pub async fn replace_budget(
    State(state): State<AdminState>,
    Json(config): Json<BudgetConfig>,
) -> Result<Json<Value>, ApiError> {
    config
        .validate()
        .map_err(|e| ApiError::bad_request("INVALID_BUDGET", e.to_string()))?;
    state.budget.replace_config(config);
    state.gate.resume();
    let status = state.budget.status(Utc::now());
    Ok(Json(json!({ "updated": true, "status": status })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub node_id: String,
    pub registration_id: Uuid,
}

fn fleet_key(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(FLEET_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("MISSING_FLEET_KEY", "Fleet key header required"))
}

/// POST /api/v1/fleet/register - announce a node before its first report.
pub async fn fleet_register(
    State(fleet): State<Arc<FleetAggregator>>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let key = fleet_key(&headers)?;
    let registration_id = fleet.register(key, &req.node_id)?;
    Ok(Json(RegisterResponse {
        node_id: req.node_id,
        registration_id,
    }))
}

/// POST /api/v1/fleet/report - accept a batch of records from a remote node.
pub async fn fleet_report(
    State(fleet): State<Arc<FleetAggregator>>,
    headers: HeaderMap,
    Json(report): Json<NodeReport>,
) -> Result<Json<SubmitOutcome>, ApiError> {
    let key = fleet_key(&headers)?;
    let outcome = fleet.submit(key, report)?;
    Ok(Json(outcome))
}
