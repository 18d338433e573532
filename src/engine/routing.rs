use crate::error::DispatchError;
use crate::geo::{haversine_km, GeoPoint};
use crate::models::assignment::{RoutePlan, RouteStop, StopKind};

/// Orders stops into a short tour with the nearest-neighbor heuristic.
/// Greedy and not globally optimal: pathological inputs can produce crossing
/// paths. Accepted trade-off for speed over optimality.
#[derive(Debug, Clone)]
pub struct RouteOptimizer {
    minutes_per_km: f64,
}

impl RouteOptimizer {
    pub fn new(minutes_per_km: f64) -> Self {
        Self { minutes_per_km }
    }

    /// Builds a visiting order over `stops`, starting from `origin` when one
    /// is given (the driver's position) or from the first eligible stop
    /// otherwise. A delivery stop only becomes eligible once its order's
    /// pickup has been visited. Deterministic: distance ties keep input
    /// order.
    pub fn optimize(
        &self,
        origin: Option<&GeoPoint>,
        stops: Vec<RouteStop>,
    ) -> Result<RoutePlan, DispatchError> {
        if stops.len() < 2 {
            return Err(DispatchError::Validation(
                "route optimization requires at least 2 waypoints".to_string(),
            ));
        }
        if let Some(stop) = stops.iter().find(|stop| !stop.point.is_valid()) {
            return Err(DispatchError::Validation(format!(
                "waypoint for order {} has coordinates out of range",
                stop.order_id
            )));
        }

        let mut remaining: Vec<RouteStop> = stops;
        let mut ordered: Vec<RouteStop> = Vec::with_capacity(remaining.len());
        let mut total_distance_km = 0.0;
        let mut cursor: Option<GeoPoint> = origin.copied();

        while !remaining.is_empty() {
            let next_index = self.pick_next(cursor.as_ref(), &ordered, &remaining);
            let stop = remaining.remove(next_index);
            if let Some(from) = cursor {
                total_distance_km += haversine_km(&from, &stop.point);
            }
            cursor = Some(stop.point);
            ordered.push(stop);
        }

        Ok(RoutePlan {
            stops: ordered,
            total_distance_km,
            total_minutes: total_distance_km * self.minutes_per_km,
        })
    }

    fn pick_next(
        &self,
        cursor: Option<&GeoPoint>,
        visited: &[RouteStop],
        remaining: &[RouteStop],
    ) -> usize {
        let eligible = |stop: &RouteStop| match stop.kind {
            StopKind::Pickup => true,
            StopKind::Delivery => visited
                .iter()
                .any(|v| v.kind == StopKind::Pickup && v.order_id == stop.order_id)
                || !remaining
                    .iter()
                    .any(|r| r.kind == StopKind::Pickup && r.order_id == stop.order_id),
        };

        let mut best: Option<(usize, f64)> = None;
        for (index, stop) in remaining.iter().enumerate() {
            if !eligible(stop) {
                continue;
            }
            let distance = match cursor {
                Some(from) => haversine_km(from, &stop.point),
                None => 0.0,
            };
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((index, distance)),
            }
            // Without a cursor the first eligible stop wins outright.
            if cursor.is_none() {
                break;
            }
        }

        // Every remaining set holds at least one eligible stop: pickups are
        // always eligible and a delivery unblocks once its pickup is gone.
        best.map(|(index, _)| index).unwrap_or(0)
    }
}
