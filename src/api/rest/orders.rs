use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::batch::{batch_orders, BatchOutcome};
use crate::engine::coordinator::{assign_order, AssignmentOutcome};
use crate::error::DispatchError;
use crate::geo::GeoPoint;
use crate::models::assignment::Assignment;
use crate::models::batch::Batch;
use crate::models::driver::VehicleType;
use crate::models::order::Order;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/assign", post(assign))
        .route("/orders/batch", post(batch))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub pickup: GeoPoint,
    pub delivery: GeoPoint,
    pub required_vehicle: Option<VehicleType>,
}

/// Distinguishes "nothing went wrong, there is just no driver right now"
/// from errors: business outcomes serialize with an outcome tag.
#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignResponse {
    Assigned { assignment: Assignment },
    NoDriversAvailable,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub order_ids: Vec<Uuid>,
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchResponse {
    Batched {
        batch: Batch,
        assignments: Vec<Assignment>,
    },
    NoDriversAvailable,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, DispatchError> {
    if !payload.pickup.is_valid() || !payload.delivery.is_valid() {
        return Err(DispatchError::Validation(
            "coordinates out of range".to_string(),
        ));
    }

    let order = Order {
        id: Uuid::new_v4(),
        pickup: payload.pickup,
        delivery: payload.delivery,
        required_vehicle: payload.required_vehicle,
        created_at: state.clock.now(),
    };

    state.orders.insert(order.clone());
    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, DispatchError> {
    let order = state
        .orders
        .get(id)
        .ok_or_else(|| DispatchError::NotFound(format!("order {id} not found")))?;

    Ok(Json(order))
}

async fn assign(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AssignResponse>, DispatchError> {
    let response = match assign_order(&state, id)? {
        AssignmentOutcome::Assigned(assignment) => AssignResponse::Assigned { assignment },
        AssignmentOutcome::NoDriversAvailable => AssignResponse::NoDriversAvailable,
    };
    Ok(Json(response))
}

async fn batch(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, DispatchError> {
    let response = match batch_orders(&state, &payload.order_ids)? {
        BatchOutcome::Batched { batch, assignments } => BatchResponse::Batched { batch, assignments },
        BatchOutcome::NoDriversAvailable => BatchResponse::NoDriversAvailable,
    };
    Ok(Json(response))
}
