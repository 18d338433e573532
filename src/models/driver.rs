use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::{haversine_km, GeoPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Bicycle,
    Motorcycle,
    Car,
}

/// Circular dispatch region a driver serves, with an optional operating-hours
/// window (UTC hours) and a priority rank. Lower rank wins when drivers are
/// otherwise tied for the same order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingZone {
    pub id: Uuid,
    pub center: GeoPoint,
    pub radius_km: f64,
    pub open_hour: Option<u32>,
    pub close_hour: Option<u32>,
    pub priority: u8,
}

impl WorkingZone {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        haversine_km(&self.center, point) <= self.radius_km
    }

    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        match (self.open_hour, self.close_hour) {
            (Some(open), Some(close)) => {
                use chrono::Timelike;
                let hour = now.hour();
                if open <= close {
                    hour >= open && hour < close
                } else {
                    // Window wraps midnight.
                    hour >= open || hour < close
                }
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DriverStats {
    pub completed: u64,
    pub cancelled: u64,
    pub total_distance_km: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub vehicle: VehicleType,
    pub location: GeoPoint,
    pub is_online: bool,
    pub is_available: bool,
    /// Cleared on suspension; suspended drivers are kept, never deleted.
    pub is_active: bool,
    pub zones: Vec<WorkingZone>,
    pub rating: f64,
    pub stats: DriverStats,
    /// Assignment currently offered to this driver, if any. Acts as the
    /// single-offer marker: a driver holds at most one open offer.
    pub current_offer: Option<Uuid>,
    pub idle_since: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn can_serve(&self) -> bool {
        self.is_active && self.is_online && self.is_available && self.current_offer.is_none()
    }

    /// The open zone containing `point` with the best (lowest) priority rank,
    /// if the driver has zones configured.
    pub fn matching_zone(&self, point: &GeoPoint, now: DateTime<Utc>) -> Option<&WorkingZone> {
        self.zones
            .iter()
            .filter(|zone| zone.is_open_at(now) && zone.contains(point))
            .min_by_key(|zone| zone.priority)
    }
}
