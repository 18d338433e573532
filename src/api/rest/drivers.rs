use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::geo::GeoPoint;
use crate::models::driver::{Driver, DriverStats, VehicleType, WorkingZone};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/location", patch(update_driver_location))
        .route("/drivers/:id/zones", post(add_working_zone))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    pub name: String,
    pub vehicle: VehicleType,
    pub location: GeoPoint,
    pub rating: f64,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub online: Option<bool>,
    pub available: Option<bool>,
    pub active: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct AddZoneRequest {
    pub center: GeoPoint,
    pub radius_km: f64,
    pub open_hour: Option<u32>,
    pub close_hour: Option<u32>,
    #[serde(default)]
    pub priority: u8,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, DispatchError> {
    if payload.name.trim().is_empty() {
        return Err(DispatchError::Validation("name cannot be empty".to_string()));
    }
    if !payload.location.is_valid() {
        return Err(DispatchError::Validation(
            "coordinates out of range".to_string(),
        ));
    }

    let now = state.clock.now();
    let driver = Driver {
        id: Uuid::new_v4(),
        name: payload.name,
        vehicle: payload.vehicle,
        location: payload.location,
        is_online: true,
        is_available: true,
        is_active: true,
        zones: Vec::new(),
        rating: payload.rating.clamp(0.0, 5.0),
        stats: DriverStats::default(),
        current_offer: None,
        idle_since: now,
        updated_at: now,
    };

    state.drivers.insert(driver.clone());
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<Driver>> {
    Json(state.drivers.list_available())
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, DispatchError> {
    let now = state.clock.now();
    let driver = state
        .drivers
        .set_status(id, payload.online, payload.available, payload.active, now)
        .ok_or_else(|| DispatchError::NotFound(format!("driver {id} not found")))?;

    Ok(Json(driver))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Driver>, DispatchError> {
    if !payload.location.is_valid() {
        return Err(DispatchError::Validation(
            "coordinates out of range".to_string(),
        ));
    }

    let now = state.clock.now();
    let driver = state
        .drivers
        .set_location(id, payload.location, now)
        .ok_or_else(|| DispatchError::NotFound(format!("driver {id} not found")))?;

    Ok(Json(driver))
}

async fn add_working_zone(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AddZoneRequest>,
) -> Result<Json<Driver>, DispatchError> {
    if payload.radius_km <= 0.0 {
        return Err(DispatchError::Validation(
            "zone radius must be > 0".to_string(),
        ));
    }
    if !payload.center.is_valid() {
        return Err(DispatchError::Validation(
            "coordinates out of range".to_string(),
        ));
    }
    if payload
        .open_hour
        .into_iter()
        .chain(payload.close_hour)
        .any(|hour| hour > 23)
    {
        return Err(DispatchError::Validation(
            "operating hours must be within 0..=23".to_string(),
        ));
    }

    let zone = WorkingZone {
        id: Uuid::new_v4(),
        center: payload.center,
        radius_km: payload.radius_km,
        open_hour: payload.open_hour,
        close_hour: payload.close_hour,
        priority: payload.priority,
    };

    let now = state.clock.now();
    let driver = state
        .drivers
        .add_zone(id, zone, now)
        .ok_or_else(|| DispatchError::NotFound(format!("driver {id} not found")))?;

    Ok(Json(driver))
}
