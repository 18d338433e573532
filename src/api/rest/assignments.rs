use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::coordinator::{
    advance_status, cancel_assignment, respond_to_offer, OfferDecision,
};
use crate::engine::eta::EtaEstimate;
use crate::engine::reporting::{generate_report, KpiReport, ReportFilters};
use crate::engine::tracker::{ingest_location, report_exception};
use crate::error::DispatchError;
use crate::geo::GeoPoint;
use crate::models::assignment::{Assignment, AssignmentStatus, DeliveryProgress, ExceptionKind};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/assignments", get(list_assignments))
        .route("/assignments/:id", get(get_assignment))
        .route("/assignments/:id/respond", post(respond))
        .route("/assignments/:id/cancel", post(cancel))
        .route("/assignments/:id/status", patch(update_status))
        .route("/assignments/:id/location", post(post_location))
        .route("/assignments/:id/eta", get(get_eta))
        .route("/assignments/:id/exceptions", post(post_exception))
        .route("/reports/deliveries", get(delivery_report))
}

#[derive(Deserialize)]
pub struct RespondRequest {
    pub driver_id: Uuid,
    pub decision: OfferDecision,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub driver_id: Uuid,
    pub status: AssignmentStatus,
}

#[derive(Deserialize)]
pub struct IngestLocationRequest {
    pub location: GeoPoint,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct ExceptionRequest {
    pub kind: ExceptionKind,
    pub details: String,
}

/// ETA unavailable (missing coordinates, no route yet) is a business
/// outcome, not an error.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EtaResponse {
    Available {
        minutes: f64,
        arrival: DateTime<Utc>,
    },
    Unavailable,
}

impl From<Option<EtaEstimate>> for EtaResponse {
    fn from(estimate: Option<EtaEstimate>) -> Self {
        match estimate {
            Some(estimate) => EtaResponse::Available {
                minutes: estimate.minutes,
                arrival: estimate.arrival,
            },
            None => EtaResponse::Unavailable,
        }
    }
}

async fn list_assignments(State(state): State<Arc<AppState>>) -> Json<Vec<Assignment>> {
    let assignments = state
        .assignments
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(assignments)
}

async fn get_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Assignment>, DispatchError> {
    let assignment = state
        .assignments
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {id} not found")))?;

    Ok(Json(assignment))
}

async fn respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RespondRequest>,
) -> Result<Json<Assignment>, DispatchError> {
    let assignment = respond_to_offer(
        &state,
        id,
        payload.driver_id,
        payload.decision,
        payload.reason,
    )?;
    Ok(Json(assignment))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Assignment>, DispatchError> {
    if payload.reason.trim().is_empty() {
        return Err(DispatchError::Validation(
            "cancellation reason is required".to_string(),
        ));
    }
    let assignment = cancel_assignment(&state, id, payload.reason)?;
    Ok(Json(assignment))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Assignment>, DispatchError> {
    let assignment = advance_status(&state, id, payload.driver_id, payload.status)?;
    Ok(Json(assignment))
}

async fn post_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<IngestLocationRequest>,
) -> Result<Json<DeliveryProgress>, DispatchError> {
    let progress = ingest_location(&state, id, payload.location, payload.recorded_at)?;
    Ok(Json(progress))
}

async fn get_eta(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<EtaResponse>, DispatchError> {
    let assignment = state
        .assignments
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {id} not found")))?;

    let estimate = assignment
        .driver_id
        .and_then(|driver_id| state.drivers.get(driver_id))
        .and_then(|driver| state.eta.customer_eta(&assignment, &driver, state.clock.now()));

    Ok(Json(estimate.into()))
}

async fn post_exception(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ExceptionRequest>,
) -> Result<Json<Assignment>, DispatchError> {
    if payload.details.trim().is_empty() {
        return Err(DispatchError::Validation(
            "exception details are required".to_string(),
        ));
    }
    let assignment = report_exception(&state, id, payload.kind, payload.details)?;
    Ok(Json(assignment))
}

async fn delivery_report(
    State(state): State<Arc<AppState>>,
    Query(filters): Query<ReportFilters>,
) -> Json<KpiReport> {
    Json(generate_report(&state, &filters))
}
