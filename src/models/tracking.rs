use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

/// Append-only location sample for an assignment. Never mutated after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub assignment_id: Uuid,
    pub point: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}
