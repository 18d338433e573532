use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::driver::VehicleType;

/// An order as this subsystem sees it: a pickup point (restaurant branch) and
/// a delivery point (customer address). Owned by the order service; read-only
/// here apart from assignment linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub pickup: GeoPoint,
    pub delivery: GeoPoint,
    pub required_vehicle: Option<VehicleType>,
    pub created_at: DateTime<Utc>,
}
