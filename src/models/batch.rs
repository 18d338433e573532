use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::assignment::RoutePlan;

/// Several assignments served in one driver run. The route spans every
/// member order's pickup and delivery; each member records its own position
/// within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub assignment_ids: Vec<Uuid>,
    pub route: RoutePlan,
    pub created_at: DateTime<Utc>,
}
