use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::DispatchConfig;
use crate::geo::{haversine_km, project_onto_route};
use crate::models::assignment::{Assignment, StopKind};
use crate::models::driver::{Driver, VehicleType};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EtaEstimate {
    pub minutes: f64,
    pub arrival: DateTime<Utc>,
}

/// Linear speed model: minutes = distance × a per-vehicle minutes-per-km
/// factor. The default reflects urban traffic, about 2 min/km.
#[derive(Debug, Clone)]
pub struct EtaCalculator {
    config: DispatchConfig,
}

impl EtaCalculator {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    pub fn minutes_for(&self, distance_km: f64, vehicle: Option<VehicleType>) -> f64 {
        distance_km * self.config.minutes_per_km_for(vehicle)
    }

    pub fn estimate(
        &self,
        distance_km: f64,
        vehicle: Option<VehicleType>,
        now: DateTime<Utc>,
    ) -> EtaEstimate {
        let minutes = self.minutes_for(distance_km, vehicle);
        EtaEstimate {
            minutes,
            arrival: now + Duration::milliseconds((minutes * 60_000.0) as i64),
        }
    }

    /// Predicted arrival at the assignment's delivery point: remaining route
    /// distance from the driver's current position, through any intermediate
    /// stops, under the same linear model. Returns None when the driver or
    /// the route lacks usable coordinates; callers surface that as an
    /// explicit "unavailable" outcome, never as a zero ETA.
    pub fn customer_eta(
        &self,
        assignment: &Assignment,
        driver: &Driver,
        now: DateTime<Utc>,
    ) -> Option<EtaEstimate> {
        let route = assignment.route.as_ref()?;
        if !driver.location.is_valid() {
            return None;
        }

        let delivery_index = route
            .stops
            .iter()
            .position(|stop| stop.kind == StopKind::Delivery && stop.order_id == assignment.order_id)?;
        let delivery_point = route.stops[delivery_index].point;
        if !delivery_point.is_valid() {
            return None;
        }

        let waypoints = route.waypoints();
        let distance_to_stop: f64 = waypoints[..=delivery_index]
            .windows(2)
            .map(|pair| haversine_km(&pair[0], &pair[1]))
            .sum();

        let projection = project_onto_route(&waypoints, &driver.location)?;
        let remaining_km = if projection.traveled_km >= distance_to_stop {
            // Past the stop on the shared route; fall back to the direct leg.
            haversine_km(&driver.location, &delivery_point)
        } else {
            distance_to_stop - projection.traveled_km + projection.deviation_km
        };

        Some(self.estimate(remaining_km, Some(driver.vehicle), now))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::geo::GeoPoint;
    use crate::models::assignment::{RoutePlan, RouteStop};
    use crate::models::driver::DriverStats;

    fn calculator() -> EtaCalculator {
        EtaCalculator::new(DispatchConfig::default())
    }

    fn driver_at(lat: f64, lng: f64) -> Driver {
        Driver {
            id: Uuid::new_v4(),
            name: "eta-driver".to_string(),
            vehicle: VehicleType::Car,
            location: GeoPoint::new(lat, lng),
            is_online: true,
            is_available: false,
            is_active: true,
            zones: Vec::new(),
            rating: 4.5,
            stats: DriverStats::default(),
            current_offer: None,
            idle_since: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn assignment_with_route(order_id: Uuid, stops: Vec<RouteStop>) -> Assignment {
        let mut assignment = Assignment::new(order_id, Utc::now());
        let total: f64 = stops
            .windows(2)
            .map(|pair| haversine_km(&pair[0].point, &pair[1].point))
            .sum();
        assignment.route = Some(RoutePlan {
            stops,
            total_distance_km: total,
            total_minutes: total * 2.0,
        });
        assignment
    }

    #[test]
    fn ten_km_at_default_factor_is_twenty_minutes() {
        let now = Utc::now();
        let estimate = calculator().estimate(10.0, None, now);
        assert!((estimate.minutes - 20.0).abs() < 1e-9);
        assert_eq!(estimate.arrival, now + chrono::Duration::minutes(20));
    }

    #[test]
    fn bicycle_factor_is_slower_than_car() {
        let calc = calculator();
        let bike = calc.minutes_for(5.0, Some(VehicleType::Bicycle));
        let car = calc.minutes_for(5.0, Some(VehicleType::Car));
        assert!(bike > car);
    }

    #[test]
    fn customer_eta_covers_remaining_route() {
        let order_id = Uuid::new_v4();
        let stops = vec![
            RouteStop {
                kind: StopKind::Pickup,
                order_id,
                point: GeoPoint::new(0.0, 0.0),
            },
            RouteStop {
                kind: StopKind::Delivery,
                order_id,
                point: GeoPoint::new(0.0, 1.0),
            },
        ];
        let assignment = assignment_with_route(order_id, stops);

        // Driver halfway along the leg: roughly 55.6 km remain.
        let driver = driver_at(0.0, 0.5);
        let eta = calculator()
            .customer_eta(&assignment, &driver, Utc::now())
            .unwrap();

        assert!((eta.minutes - 55.6 * 2.0).abs() < 2.0);
    }

    #[test]
    fn eta_is_unavailable_without_a_route() {
        let assignment = Assignment::new(Uuid::new_v4(), Utc::now());
        let driver = driver_at(0.0, 0.0);
        assert!(calculator()
            .customer_eta(&assignment, &driver, Utc::now())
            .is_none());
    }

    #[test]
    fn eta_is_unavailable_with_bad_driver_coordinates() {
        let order_id = Uuid::new_v4();
        let stops = vec![
            RouteStop {
                kind: StopKind::Pickup,
                order_id,
                point: GeoPoint::new(0.0, 0.0),
            },
            RouteStop {
                kind: StopKind::Delivery,
                order_id,
                point: GeoPoint::new(0.0, 1.0),
            },
        ];
        let assignment = assignment_with_route(order_id, stops);
        let mut driver = driver_at(0.0, 0.0);
        driver.location = GeoPoint::new(f64::NAN, 46.7);

        assert!(calculator()
            .customer_eta(&assignment, &driver, Utc::now())
            .is_none());
    }
}
