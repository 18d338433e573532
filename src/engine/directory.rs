use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::geo::{haversine_km, within_bounding_box, GeoPoint};
use crate::models::driver::{Driver, VehicleType};
use crate::store::DriverStore;

/// Caller-supplied narrowing on top of the availability rules.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilters {
    pub vehicle: Option<VehicleType>,
    pub zone_id: Option<Uuid>,
    pub max_distance_km: Option<f64>,
    /// Drivers that already had an offer for this assignment.
    pub exclude: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub driver: Driver,
    pub distance_km: f64,
    zone_priority: u8,
}

/// Answers "which drivers can serve this point right now", ranked. Reads
/// through the injected store so tests can substitute a fake.
#[derive(Clone)]
pub struct DriverDirectory {
    store: Arc<dyn DriverStore>,
    config: DispatchConfig,
}

impl DriverDirectory {
    pub fn new(store: Arc<dyn DriverStore>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    /// Ranking: nearest first, then highest rating, then longest idle, then
    /// best working-zone priority rank. Returns an empty list when nothing
    /// matches; never an error.
    pub fn find_candidates(
        &self,
        point: &GeoPoint,
        filters: &CandidateFilters,
        now: DateTime<Utc>,
    ) -> Vec<RankedCandidate> {
        let mut candidates: Vec<RankedCandidate> = self
            .store
            .list_available()
            .into_iter()
            .filter(|driver| !filters.exclude.contains(&driver.id))
            .filter(|driver| {
                filters
                    .vehicle
                    .is_none_or(|required| driver.vehicle == required)
            })
            .filter_map(|driver| self.rank(driver, point, filters, now))
            .collect();

        candidates.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then(b.driver.rating.total_cmp(&a.driver.rating))
                .then(a.driver.idle_since.cmp(&b.driver.idle_since))
                .then(a.zone_priority.cmp(&b.zone_priority))
        });
        candidates
    }

    fn rank(
        &self,
        driver: Driver,
        point: &GeoPoint,
        filters: &CandidateFilters,
        now: DateTime<Utc>,
    ) -> Option<RankedCandidate> {
        if driver.zones.is_empty() {
            // No zones configured: the global max-distance rule applies.
            let limit = filters
                .max_distance_km
                .unwrap_or(self.config.default_max_distance_km);
            if filters.zone_id.is_some() {
                return None;
            }
            if !within_bounding_box(point, &driver.location, limit) {
                return None;
            }
            let distance_km = haversine_km(&driver.location, point);
            if distance_km > limit {
                return None;
            }
            return Some(RankedCandidate {
                driver,
                distance_km,
                zone_priority: u8::MAX,
            });
        }

        let zone = driver.matching_zone(point, now)?;
        if let Some(required) = filters.zone_id {
            if !driver.zones.iter().any(|z| z.id == required && z.contains(point)) {
                return None;
            }
        }
        let zone_priority = zone.priority;

        let distance_km = haversine_km(&driver.location, point);
        if let Some(limit) = filters.max_distance_km {
            if distance_km > limit {
                return None;
            }
        }

        Some(RankedCandidate {
            driver,
            distance_km,
            zone_priority,
        })
    }
}
