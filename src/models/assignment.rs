use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Offered,
    Accepted,
    EnRouteToPickup,
    PickedUp,
    EnRouteToDelivery,
    Delivered,
    Failed,
    Cancelled,
}

impl AssignmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Cancelled)
    }

    /// Enumerated transition table. A re-offer after a decline or timeout is
    /// `Offered -> Offered`; `Failed` and `Cancelled` are reachable from any
    /// non-terminal state.
    pub fn can_transition(&self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Offered)
                | (Offered, Offered)
                | (Offered, Accepted)
                | (Accepted, EnRouteToPickup)
                | (EnRouteToPickup, PickedUp)
                | (PickedUp, EnRouteToDelivery)
                | (EnRouteToDelivery, Delivered)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    Pending,
    Accepted,
    Declined,
    TimedOut,
    Superseded,
}

/// One driver's opportunity to take the assignment. Declined and timed-out
/// offers stay in the history so the driver is never offered again for the
/// same assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferRecord {
    pub driver_id: Uuid,
    pub offered_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub outcome: OfferOutcome,
    pub reason: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Pickup,
    Delivery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStop {
    pub kind: StopKind,
    pub order_id: Uuid,
    pub point: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePlan {
    pub stops: Vec<RouteStop>,
    pub total_distance_km: f64,
    pub total_minutes: f64,
}

impl RoutePlan {
    pub fn waypoints(&self) -> Vec<GeoPoint> {
        self.stops.iter().map(|stop| stop.point).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    Stalled,
    OffRoute,
    MissedWindow,
    FailedHandoff,
    Delayed,
}

/// Flags an assignment for operator attention; never blocks the state
/// machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryException {
    pub kind: ExceptionKind,
    pub detected_at: DateTime<Utc>,
    pub details: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryProgress {
    pub last_position: Option<GeoPoint>,
    pub percent_complete: f64,
    pub last_moved_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Set while an offer is open or accepted; None before the first offer.
    pub driver_id: Option<Uuid>,
    pub status: AssignmentStatus,
    /// Bumped on every offer and terminal transition. A respond() carrying a
    /// stale epoch lost the race and is rejected.
    pub offer_epoch: u64,
    pub offers: Vec<OfferRecord>,
    pub batch_id: Option<Uuid>,
    pub route: Option<RoutePlan>,
    pub eta: Option<DateTime<Utc>>,
    pub progress: DeliveryProgress,
    pub exceptions: Vec<DeliveryException>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    pub fn new(order_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            driver_id: None,
            status: AssignmentStatus::Pending,
            offer_epoch: 0,
            offers: Vec::new(),
            batch_id: None,
            route: None,
            eta: None,
            progress: DeliveryProgress::default(),
            exceptions: Vec::new(),
            created_at: now,
            accepted_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn open_offer(&self) -> Option<&OfferRecord> {
        self.offers
            .last()
            .filter(|offer| offer.outcome == OfferOutcome::Pending)
    }

    pub fn open_offer_mut(&mut self) -> Option<&mut OfferRecord> {
        self.offers
            .last_mut()
            .filter(|offer| offer.outcome == OfferOutcome::Pending)
    }

    /// Drivers that already had their chance at this assignment, open offer
    /// included.
    pub fn offered_driver_ids(&self) -> Vec<Uuid> {
        self.offers.iter().map(|offer| offer.driver_id).collect()
    }
}
