use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::rest::assignments::EtaResponse;
use crate::error::DispatchError;
use crate::geo::{route_length_km, GeoPoint};
use crate::models::assignment::{RoutePlan, RouteStop, StopKind};
use crate::models::driver::VehicleType;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/routes/optimize", post(optimize))
        .route("/routes/eta", post(adhoc_eta))
}

#[derive(Deserialize)]
pub struct OptimizeRequest {
    pub origin: Option<GeoPoint>,
    pub waypoints: Vec<GeoPoint>,
}

#[derive(Serialize)]
pub struct OptimizeResponse {
    pub ordered_stops: Vec<GeoPoint>,
    pub total_distance_km: f64,
    pub total_minutes: f64,
}

#[derive(Deserialize)]
pub struct AdhocEtaRequest {
    pub waypoints: Vec<GeoPoint>,
    pub vehicle: Option<VehicleType>,
}

/// Ad hoc tour planning over untagged waypoints; no pickup/delivery
/// precedence applies.
async fn optimize(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OptimizeRequest>,
) -> Result<Json<OptimizeResponse>, DispatchError> {
    if let Some(origin) = &payload.origin {
        if !origin.is_valid() {
            return Err(DispatchError::Validation(
                "origin coordinates out of range".to_string(),
            ));
        }
    }

    let stops: Vec<RouteStop> = payload
        .waypoints
        .iter()
        .map(|point| RouteStop {
            kind: StopKind::Pickup,
            order_id: Uuid::new_v4(),
            point: *point,
        })
        .collect();

    let plan: RoutePlan = state.router.optimize(payload.origin.as_ref(), stops)?;
    Ok(Json(OptimizeResponse {
        ordered_stops: plan.waypoints(),
        total_distance_km: plan.total_distance_km,
        total_minutes: plan.total_minutes,
    }))
}

/// ETA over a caller-supplied leg sequence, without an assignment.
async fn adhoc_eta(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AdhocEtaRequest>,
) -> Result<Json<EtaResponse>, DispatchError> {
    if payload.waypoints.len() < 2 {
        return Err(DispatchError::Validation(
            "eta requires at least 2 waypoints".to_string(),
        ));
    }
    if payload.waypoints.iter().any(|point| !point.is_valid()) {
        return Ok(Json(EtaResponse::Unavailable));
    }

    let distance_km = route_length_km(&payload.waypoints);
    let estimate = state
        .eta
        .estimate(distance_km, payload.vehicle, state.clock.now());
    Ok(Json(Some(estimate).into()))
}
