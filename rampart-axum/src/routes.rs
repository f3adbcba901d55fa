use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    routing::{get, post},
};
use rampart::{AdminAction, AdminOutcome, BruteForceStats, Rampart, SecurityOverview};

use crate::{
    error::{Result, SecurityError},
    extractors::AdminActor,
    types::{AuditLogParams, AuditLogResponse},
};

#[derive(Clone)]
pub struct AdminState {
    pub rampart: Arc<Rampart>,
}

pub fn create_admin_router(rampart: Arc<Rampart>) -> Router {
    let state = AdminState { rampart };

    Router::new()
        .route("/audit-logs", get(audit_logs_handler))
        .route("/brute-force/stats", get(brute_force_stats_handler))
        .route("/overview", get(overview_handler))
        .route("/actions", post(admin_action_handler))
        .with_state(state)
}

async fn audit_logs_handler(
    State(state): State<AdminState>,
    params: std::result::Result<Query<AuditLogParams>, QueryRejection>,
) -> Result<Json<AuditLogResponse>> {
    let Query(params) = params.map_err(|e| SecurityError::BadRequest(e.body_text()))?;
    let query = params.into_query()?;

    let events = state.rampart.get_audit_logs(&query)?;

    Ok(Json(AuditLogResponse {
        count: events.len(),
        events,
    }))
}

async fn brute_force_stats_handler(
    State(state): State<AdminState>,
) -> Result<Json<BruteForceStats>> {
    Ok(Json(state.rampart.get_brute_force_stats()?))
}

async fn overview_handler(State(state): State<AdminState>) -> Json<SecurityOverview> {
    Json(state.rampart.get_security_overview())
}

async fn admin_action_handler(
    State(state): State<AdminState>,
    AdminActor(actor_id): AdminActor,
    action: std::result::Result<Json<AdminAction>, JsonRejection>,
) -> Result<Json<AdminOutcome>> {
    let Json(action) = action.map_err(|e| SecurityError::BadRequest(e.body_text()))?;

    let outcome = state.rampart.perform_admin_action(&actor_id, action)?;

    Ok(Json(outcome))
}
