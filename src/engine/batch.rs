use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::coordinator::{
    check_open_offer, fail_assignment, single_order_stops, OfferDecision,
};
use crate::engine::directory::CandidateFilters;
use crate::error::DispatchError;
use crate::models::assignment::{
    Assignment, AssignmentStatus, OfferOutcome, OfferRecord, RoutePlan, RouteStop, StopKind,
};
use crate::models::batch::Batch;
use crate::models::driver::VehicleType;
use crate::models::order::Order;
use crate::notify::Recipient;
use crate::state::{AppState, EventKind};

/// Business outcome of a batch call, mirroring single-order assignment.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Batched {
        batch: Batch,
        assignments: Vec<Assignment>,
    },
    NoDriversAvailable,
}

/// Combines 2+ pending orders into one driver run: a shared route over every
/// pickup and delivery, one assignment per order bound to the same driver
/// slot.
pub fn batch_orders(state: &AppState, order_ids: &[Uuid]) -> Result<BatchOutcome, DispatchError> {
    if order_ids.len() < 2 {
        return Err(DispatchError::Validation(
            "batching requires at least 2 orders".to_string(),
        ));
    }
    let distinct: HashSet<Uuid> = order_ids.iter().copied().collect();
    if distinct.len() != order_ids.len() {
        return Err(DispatchError::Validation(
            "duplicate order ids in batch".to_string(),
        ));
    }

    let now = state.clock.now();
    let orders = state.orders.get_many(order_ids);
    if orders.len() != order_ids.len() {
        let found: HashSet<Uuid> = orders.iter().map(|o| o.id).collect();
        let missing = order_ids
            .iter()
            .find(|id| !found.contains(id))
            .expect("at least one id is missing");
        return Err(DispatchError::NotFound(format!("order {missing} not found")));
    }
    let vehicle = common_vehicle(&orders)?;

    let batch_id = Uuid::new_v4();
    let mut assignments: Vec<Assignment> = orders
        .iter()
        .map(|order| {
            let mut assignment = Assignment::new(order.id, now);
            assignment.batch_id = Some(batch_id);
            assignment
        })
        .collect();

    let mut claimed: Vec<Uuid> = Vec::with_capacity(orders.len());
    for assignment in &assignments {
        if let Err(err) =
            crate::engine::coordinator::reserve_order_slot(state, assignment.order_id, assignment.id)
        {
            release_claims(state, &claimed);
            return Err(err);
        }
        claimed.push(assignment.order_id);
    }

    let filters = CandidateFilters {
        vehicle,
        ..Default::default()
    };
    let candidates = state
        .directory
        .find_candidates(&orders[0].pickup, &filters, now);

    let winner = candidates
        .iter()
        .find(|candidate| state.drivers.try_mark_offered(candidate.driver.id, batch_id, now));
    let Some(winner) = winner else {
        release_claims(state, &claimed);
        state
            .metrics
            .assignments_total
            .with_label_values(&["no_drivers"])
            .inc();
        info!(orders = order_ids.len(), "no drivers available for batch");
        return Ok(BatchOutcome::NoDriversAvailable);
    };
    let driver_id = winner.driver.id;

    let route = match state
        .router
        .optimize(Some(&winner.driver.location), batch_stops(&orders))
    {
        Ok(route) => route,
        Err(err) => {
            state.drivers.clear_offer(driver_id, batch_id, now);
            release_claims(state, &claimed);
            return Err(err);
        }
    };

    let deadline = now + Duration::seconds(state.config.dispatch.offer_response_secs);
    for assignment in &mut assignments {
        assignment.status = AssignmentStatus::Offered;
        assignment.driver_id = Some(driver_id);
        assignment.offer_epoch = 1;
        assignment.offers.push(OfferRecord {
            driver_id,
            offered_at: now,
            deadline,
            outcome: OfferOutcome::Pending,
            reason: None,
            responded_at: None,
        });
        assignment.route = Some(route.clone());
        assignment.updated_at = now;
    }
    sort_by_route_position(&mut assignments, &route);

    let batch = Batch {
        id: batch_id,
        driver_id,
        assignment_ids: assignments.iter().map(|a| a.id).collect(),
        route: route.clone(),
        created_at: now,
    };

    for assignment in &assignments {
        state.assignments.insert(assignment.id, assignment.clone());
        state.publish(EventKind::Offered, assignment);
    }
    state.batches.insert(batch.id, batch.clone());

    let n = assignments.len() as u64;
    state.metrics.active_assignments.add(n as i64);
    state
        .metrics
        .assignments_total
        .with_label_values(&["assigned"])
        .inc_by(n);
    state
        .metrics
        .offers_total
        .with_label_values(&["offered"])
        .inc_by(n);
    state.notifier.notify(
        Recipient::Driver,
        driver_id,
        "batch_offer",
        json!({
            "batch_id": batch.id,
            "orders": order_ids.len(),
            "total_distance_km": route.total_distance_km,
            "respond_by": deadline,
        }),
    );
    info!(batch_id = %batch.id, driver_id = %driver_id, orders = order_ids.len(), "batch offered");

    Ok(BatchOutcome::Batched { batch, assignments })
}

/// Accept/decline for a batched offer. The whole batch shares one driver
/// slot, so the decision settles every member; the batch entry lock
/// serializes concurrent responders.
pub(crate) fn respond_to_batch(
    state: &AppState,
    batch_id: Uuid,
    assignment_id: Uuid,
    driver_id: Uuid,
    decision: OfferDecision,
    reason: Option<String>,
) -> Result<Assignment, DispatchError> {
    let now = state.clock.now();
    let mut batch_entry = state
        .batches
        .get_mut(&batch_id)
        .ok_or_else(|| DispatchError::NotFound(format!("batch {batch_id} not found")))?;
    let batch = batch_entry.value_mut();

    let probe = state
        .assignments
        .get(&assignment_id)
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id} not found")))?
        .clone();
    check_open_offer(&probe, driver_id, now)?;

    match decision {
        OfferDecision::Accept => accept_batch(state, batch, driver_id, now)?,
        OfferDecision::Decline => {
            let settled =
                settle_member_offers(state, batch, OfferOutcome::Declined, reason, driver_id, now);
            state
                .metrics
                .offers_total
                .with_label_values(&["declined"])
                .inc_by(settled as u64);
            state.drivers.clear_offer(driver_id, batch_id, now);
            reoffer_or_fail_batch(state, batch, now);
        }
    }

    let updated = state
        .assignments
        .get(&assignment_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| DispatchError::Internal("assignment vanished".to_string()))?;
    Ok(updated)
}

fn accept_batch(
    state: &AppState,
    batch: &Batch,
    driver_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    let driver = state
        .drivers
        .get(driver_id)
        .ok_or_else(|| DispatchError::Internal(format!("driver {driver_id} vanished")))?;

    state
        .drivers
        .set_status(driver_id, None, Some(false), None, now);
    state.drivers.clear_offer(driver_id, batch.id, now);

    let mut accepted = 0u64;
    for member_id in &batch.assignment_ids {
        let Some(mut entry) = state.assignments.get_mut(member_id) else {
            continue;
        };
        let member = entry.value_mut();
        if member.status != AssignmentStatus::Offered {
            continue;
        }
        let Some(offer) = member.open_offer_mut() else {
            continue;
        };
        if offer.driver_id != driver_id {
            continue;
        }
        offer.outcome = OfferOutcome::Accepted;
        offer.responded_at = Some(now);

        member.status = AssignmentStatus::Accepted;
        member.accepted_at = Some(now);
        member.updated_at = now;
        // Per-order ETA derived from the member's position in the shared
        // route.
        if let Some(km) = distance_to_delivery(&batch.route, &driver.location, member.order_id) {
            member.eta = Some(state.eta.estimate(km, Some(driver.vehicle), now).arrival);
        }

        state.notifier.notify(
            Recipient::Customer,
            member.order_id,
            "driver_assigned",
            json!({
                "assignment_id": member.id,
                "driver": driver.name,
                "eta": member.eta,
            }),
        );
        state.publish(EventKind::Accepted, member);
        accepted += 1;
    }

    state
        .metrics
        .offers_total
        .with_label_values(&["accepted"])
        .inc_by(accepted);
    info!(batch_id = %batch.id, driver_id = %driver_id, members = accepted, "batch accepted");
    Ok(())
}

/// Settles expired batch offers exactly like an implicit decline with reason
/// "timeout". Returns how many member offers were settled.
pub(crate) fn timeout_batch(state: &AppState, batch_id: Uuid, now: DateTime<Utc>) -> usize {
    let Some(mut batch_entry) = state.batches.get_mut(&batch_id) else {
        return 0;
    };
    let batch = batch_entry.value_mut();

    let expired_driver = batch.assignment_ids.iter().find_map(|member_id| {
        let member = state.assignments.get(member_id)?;
        if member.status != AssignmentStatus::Offered {
            return None;
        }
        let offer = member.open_offer()?;
        (now > offer.deadline).then_some(offer.driver_id)
    });
    let Some(driver_id) = expired_driver else {
        return 0;
    };

    let settled = settle_member_offers(
        state,
        batch,
        OfferOutcome::TimedOut,
        Some("timeout".to_string()),
        driver_id,
        now,
    );
    state
        .metrics
        .offers_total
        .with_label_values(&["timed_out"])
        .inc_by(settled as u64);
    state.drivers.clear_offer(driver_id, batch_id, now);
    reoffer_or_fail_batch(state, batch, now);
    settled
}

fn settle_member_offers(
    state: &AppState,
    batch: &Batch,
    outcome: OfferOutcome,
    reason: Option<String>,
    driver_id: Uuid,
    now: DateTime<Utc>,
) -> usize {
    let event = match outcome {
        OfferOutcome::TimedOut => EventKind::TimedOut,
        _ => EventKind::Declined,
    };

    let mut settled = 0;
    for member_id in &batch.assignment_ids {
        let Some(mut entry) = state.assignments.get_mut(member_id) else {
            continue;
        };
        let member = entry.value_mut();
        if member.status != AssignmentStatus::Offered {
            continue;
        }
        let Some(offer) = member.open_offer_mut() else {
            continue;
        };
        if offer.driver_id != driver_id {
            continue;
        }
        offer.outcome = outcome;
        offer.reason = reason.clone();
        offer.responded_at = Some(now);
        member.updated_at = now;
        state.publish(event, member);
        settled += 1;
    }
    settled
}

/// Escalates the whole batch to the next candidate, or fails every still-open
/// member when candidates or offer rounds run out.
fn reoffer_or_fail_batch(state: &AppState, batch: &mut Batch, now: DateTime<Utc>) {
    let members: Vec<Assignment> = batch
        .assignment_ids
        .iter()
        .filter_map(|id| state.assignments.get(id).map(|entry| entry.value().clone()))
        .filter(|member| member.status == AssignmentStatus::Offered)
        .collect();
    if members.is_empty() {
        return;
    }

    let rounds = members.iter().map(|m| m.offers.len()).max().unwrap_or(0);
    if rounds >= state.config.dispatch.max_offer_rounds as usize {
        fail_open_members(state, batch, "offer rounds exhausted", now);
        return;
    }

    let order_ids: Vec<Uuid> = members.iter().map(|m| m.order_id).collect();
    let orders = state.orders.get_many(&order_ids);
    let Ok(vehicle) = common_vehicle(&orders) else {
        fail_open_members(state, batch, "orders no longer batchable", now);
        return;
    };
    if orders.is_empty() {
        fail_open_members(state, batch, "orders vanished", now);
        return;
    }

    let exclude: Vec<Uuid> = {
        let mut seen = HashSet::new();
        members
            .iter()
            .flat_map(|m| m.offered_driver_ids())
            .filter(|id| seen.insert(*id))
            .collect()
    };
    let filters = CandidateFilters {
        vehicle,
        exclude,
        ..Default::default()
    };
    let candidates = state
        .directory
        .find_candidates(&orders[0].pickup, &filters, now);

    let winner = candidates
        .iter()
        .find(|candidate| state.drivers.try_mark_offered(candidate.driver.id, batch.id, now));
    let Some(winner) = winner else {
        fail_open_members(state, batch, "candidates exhausted", now);
        return;
    };
    let next_driver = winner.driver.id;

    let route = match state
        .router
        .optimize(Some(&winner.driver.location), batch_stops(&orders))
    {
        Ok(route) => route,
        Err(err) => {
            warn!(batch_id = %batch.id, error = %err, "batch re-route failed");
            state.drivers.clear_offer(next_driver, batch.id, now);
            fail_open_members(state, batch, "re-route failed", now);
            return;
        }
    };

    let deadline = now + Duration::seconds(state.config.dispatch.offer_response_secs);
    let mut reoffered = 0u64;
    for member_id in &batch.assignment_ids {
        let Some(mut entry) = state.assignments.get_mut(member_id) else {
            continue;
        };
        let member = entry.value_mut();
        if member.status != AssignmentStatus::Offered {
            continue;
        }
        member.driver_id = Some(next_driver);
        member.offer_epoch += 1;
        member.offers.push(OfferRecord {
            driver_id: next_driver,
            offered_at: now,
            deadline,
            outcome: OfferOutcome::Pending,
            reason: None,
            responded_at: None,
        });
        member.route = Some(route.clone());
        member.updated_at = now;
        state.publish(EventKind::Offered, member);
        reoffered += 1;
    }

    batch.driver_id = next_driver;
    batch.route = route.clone();
    resort_batch_positions(state, batch);

    state
        .metrics
        .offers_total
        .with_label_values(&["offered"])
        .inc_by(reoffered);
    state.notifier.notify(
        Recipient::Driver,
        next_driver,
        "batch_offer",
        json!({
            "batch_id": batch.id,
            "orders": batch.assignment_ids.len(),
            "total_distance_km": route.total_distance_km,
            "respond_by": deadline,
        }),
    );
    info!(batch_id = %batch.id, driver_id = %next_driver, "batch re-offered");
}

fn fail_open_members(state: &AppState, batch: &Batch, cause: &str, now: DateTime<Utc>) {
    for member_id in &batch.assignment_ids {
        let Some(mut entry) = state.assignments.get_mut(member_id) else {
            continue;
        };
        let member = entry.value_mut();
        if member.status == AssignmentStatus::Offered {
            fail_assignment(state, member, cause, now);
        }
    }
}

fn release_claims(state: &AppState, order_ids: &[Uuid]) {
    for order_id in order_ids {
        state.assignments_by_order.remove(order_id);
    }
}

fn batch_stops(orders: &[Order]) -> Vec<RouteStop> {
    orders.iter().flat_map(single_order_stops).collect()
}

fn common_vehicle(orders: &[Order]) -> Result<Option<VehicleType>, DispatchError> {
    let mut required: Option<VehicleType> = None;
    for order in orders {
        match (required, order.required_vehicle) {
            (Some(a), Some(b)) if a != b => {
                return Err(DispatchError::Validation(
                    "orders require incompatible vehicle types".to_string(),
                ));
            }
            (None, Some(b)) => required = Some(b),
            _ => {}
        }
    }
    Ok(required)
}

/// Members are kept in delivery order along the shared route, so positions
/// within the run increase monotonically.
fn sort_by_route_position(assignments: &mut [Assignment], route: &RoutePlan) {
    assignments.sort_by_key(|assignment| delivery_position(route, assignment.order_id));
}

fn resort_batch_positions(state: &AppState, batch: &mut Batch) {
    let route = batch.route.clone();
    batch.assignment_ids.sort_by_key(|id| {
        state
            .assignments
            .get(id)
            .map(|entry| delivery_position(&route, entry.value().order_id))
            .unwrap_or(usize::MAX)
    });
}

fn delivery_position(route: &RoutePlan, order_id: Uuid) -> usize {
    route
        .stops
        .iter()
        .position(|stop| stop.kind == StopKind::Delivery && stop.order_id == order_id)
        .unwrap_or(usize::MAX)
}

/// Driver-to-stop distance along the shared route, up to the member's
/// delivery stop.
fn distance_to_delivery(
    route: &RoutePlan,
    driver_location: &crate::geo::GeoPoint,
    order_id: Uuid,
) -> Option<f64> {
    use crate::geo::haversine_km;

    let index = {
        let position = delivery_position(route, order_id);
        (position < route.stops.len()).then_some(position)?
    };
    let waypoints = route.waypoints();
    let mut km = haversine_km(driver_location, &waypoints[0]);
    km += waypoints[..=index]
        .windows(2)
        .map(|pair| haversine_km(&pair[0], &pair[1]))
        .sum::<f64>();
    Some(km)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::coordinator::respond_to_offer;
    use crate::engine::testutil::harness;
    use crate::geo::GeoPoint;

    #[test]
    fn single_order_batch_is_a_validation_error() {
        let h = harness();
        let order = h.add_order(GeoPoint::new(24.71, 46.67), GeoPoint::new(24.72, 46.68));

        let result = batch_orders(&h.state, &[order]);
        assert!(matches!(result, Err(DispatchError::Validation(_))));
    }

    #[test]
    fn batch_creates_one_assignment_per_order_with_shared_driver_and_route() {
        let h = harness();
        let driver = h.add_driver(24.7136, 46.6753, 4.5);
        let o1 = h.add_order(GeoPoint::new(24.7118, 46.6749), GeoPoint::new(24.7300, 46.6900));
        let o2 = h.add_order(GeoPoint::new(24.7120, 46.6750), GeoPoint::new(24.7400, 46.7000));

        let outcome = batch_orders(&h.state, &[o1, o2]).unwrap();
        let BatchOutcome::Batched { batch, assignments } = outcome else {
            panic!("expected a batched outcome");
        };

        assert_eq!(assignments.len(), 2);
        assert_eq!(batch.assignment_ids.len(), 2);
        for assignment in &assignments {
            assert_eq!(assignment.driver_id, Some(driver));
            assert_eq!(assignment.batch_id, Some(batch.id));
            assert_eq!(assignment.status, AssignmentStatus::Offered);
            // Shared route spans every pickup and delivery.
            assert_eq!(assignment.route.as_ref().unwrap().stops.len(), 4);
        }

        // Members are ordered by their delivery position in the shared route.
        let positions: Vec<usize> = batch
            .assignment_ids
            .iter()
            .map(|id| {
                let member = h.state.assignments.get(id).unwrap();
                delivery_position(&batch.route, member.order_id)
            })
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn batch_with_no_drivers_leaves_no_assignments() {
        let h = harness();
        let o1 = h.add_order(GeoPoint::new(24.7118, 46.6749), GeoPoint::new(24.7300, 46.6900));
        let o2 = h.add_order(GeoPoint::new(24.7120, 46.6750), GeoPoint::new(24.7400, 46.7000));

        let outcome = batch_orders(&h.state, &[o1, o2]).unwrap();
        assert!(matches!(outcome, BatchOutcome::NoDriversAvailable));
        assert!(h.state.assignments.is_empty());
        assert!(h.state.assignments_by_order.is_empty());
    }

    #[test]
    fn accepting_one_member_accepts_the_whole_batch() {
        let h = harness();
        let driver = h.add_driver(24.7136, 46.6753, 4.5);
        let o1 = h.add_order(GeoPoint::new(24.7118, 46.6749), GeoPoint::new(24.7300, 46.6900));
        let o2 = h.add_order(GeoPoint::new(24.7120, 46.6750), GeoPoint::new(24.7400, 46.7000));

        let BatchOutcome::Batched { assignments, .. } = batch_orders(&h.state, &[o1, o2]).unwrap()
        else {
            panic!("expected a batched outcome");
        };

        let first = assignments[0].id;
        let updated =
            respond_to_offer(&h.state, first, driver, OfferDecision::Accept, None).unwrap();
        assert_eq!(updated.status, AssignmentStatus::Accepted);

        for assignment in &assignments {
            let member = h.state.assignments.get(&assignment.id).unwrap();
            assert_eq!(member.status, AssignmentStatus::Accepted);
            assert!(member.eta.is_some());
        }
    }

    #[test]
    fn declining_a_batch_with_no_fallback_fails_every_member() {
        let h = harness();
        let driver = h.add_driver(24.7136, 46.6753, 4.5);
        let o1 = h.add_order(GeoPoint::new(24.7118, 46.6749), GeoPoint::new(24.7300, 46.6900));
        let o2 = h.add_order(GeoPoint::new(24.7120, 46.6750), GeoPoint::new(24.7400, 46.7000));

        let BatchOutcome::Batched { assignments, .. } = batch_orders(&h.state, &[o1, o2]).unwrap()
        else {
            panic!("expected a batched outcome");
        };

        respond_to_offer(
            &h.state,
            assignments[0].id,
            driver,
            OfferDecision::Decline,
            Some("too_far".to_string()),
        )
        .unwrap();

        for assignment in &assignments {
            let member = h.state.assignments.get(&assignment.id).unwrap();
            assert_eq!(member.status, AssignmentStatus::Failed);
        }
    }

    #[test]
    fn declined_batch_rolls_to_the_next_candidate() {
        let h = harness();
        let near = h.add_driver(24.7136, 46.6753, 4.5);
        let far = h.add_driver(24.7300, 46.6900, 4.0);
        let o1 = h.add_order(GeoPoint::new(24.7118, 46.6749), GeoPoint::new(24.7300, 46.6900));
        let o2 = h.add_order(GeoPoint::new(24.7120, 46.6750), GeoPoint::new(24.7400, 46.7000));

        let BatchOutcome::Batched { assignments, batch } = batch_orders(&h.state, &[o1, o2]).unwrap()
        else {
            panic!("expected a batched outcome");
        };
        assert_eq!(batch.driver_id, near);

        respond_to_offer(
            &h.state,
            assignments[0].id,
            near,
            OfferDecision::Decline,
            Some("too_far".to_string()),
        )
        .unwrap();

        let updated = h.state.batches.get(&batch.id).unwrap();
        assert_eq!(updated.driver_id, far);
        for member_id in &updated.assignment_ids {
            let member = h.state.assignments.get(member_id).unwrap();
            assert_eq!(member.status, AssignmentStatus::Offered);
            assert_eq!(member.driver_id, Some(far));
            assert_eq!(member.offers.len(), 2);
        }
    }
}
