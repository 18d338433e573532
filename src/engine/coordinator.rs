use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::batch;
use crate::engine::directory::{CandidateFilters, RankedCandidate};
use crate::error::DispatchError;
use crate::models::assignment::{
    Assignment, AssignmentStatus, OfferOutcome, OfferRecord, RouteStop, StopKind,
};
use crate::models::order::Order;
use crate::notify::Recipient;
use crate::state::{AppState, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferDecision {
    Accept,
    Decline,
}

/// Business outcome of an assign call. "No drivers available" is a
/// legitimate state, not an error.
#[derive(Debug, Clone)]
pub enum AssignmentOutcome {
    Assigned(Assignment),
    NoDriversAvailable,
}

/// Drives an order from "needs a driver" to a single open offer. When no
/// candidate exists, no assignment record is left behind.
pub fn assign_order(state: &AppState, order_id: Uuid) -> Result<AssignmentOutcome, DispatchError> {
    let started = Instant::now();
    let outcome = do_assign(state, order_id);

    let label = match &outcome {
        Ok(AssignmentOutcome::Assigned(_)) => "assigned",
        Ok(AssignmentOutcome::NoDriversAvailable) => "no_drivers",
        Err(_) => "error",
    };
    state
        .metrics
        .assignment_latency_seconds
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());

    outcome
}

fn do_assign(state: &AppState, order_id: Uuid) -> Result<AssignmentOutcome, DispatchError> {
    let now = state.clock.now();
    let order = state
        .orders
        .get(order_id)
        .ok_or_else(|| DispatchError::NotFound(format!("order {order_id} not found")))?;

    let assignment = Assignment::new(order_id, now);
    reserve_order_slot(state, order_id, assignment.id)?;

    let filters = CandidateFilters {
        vehicle: order.required_vehicle,
        ..Default::default()
    };
    let candidates = state.directory.find_candidates(&order.pickup, &filters, now);

    let mut assignment = assignment;
    if try_offer(state, &mut assignment, &candidates, now).is_none() {
        state.assignments_by_order.remove(&order_id);
        state
            .metrics
            .assignments_total
            .with_label_values(&["no_drivers"])
            .inc();
        info!(order_id = %order_id, "no drivers available");
        return Ok(AssignmentOutcome::NoDriversAvailable);
    }

    state.metrics.active_assignments.inc();
    state
        .metrics
        .assignments_total
        .with_label_values(&["assigned"])
        .inc();
    state.assignments.insert(assignment.id, assignment.clone());
    state.publish(EventKind::Offered, &assignment);
    info!(
        order_id = %order_id,
        assignment_id = %assignment.id,
        driver_id = ?assignment.driver_id,
        "order offered"
    );

    Ok(AssignmentOutcome::Assigned(assignment))
}

/// Claims the order's one-active-assignment slot. An occupied slot whose
/// record is missing belongs to an assign call still in flight.
pub(crate) fn reserve_order_slot(
    state: &AppState,
    order_id: Uuid,
    assignment_id: Uuid,
) -> Result<(), DispatchError> {
    use dashmap::mapref::entry::Entry;

    match state.assignments_by_order.entry(order_id) {
        Entry::Occupied(mut occupied) => {
            let active = match state.assignments.get(occupied.get()) {
                Some(existing) => !existing.status.is_terminal(),
                None => true,
            };
            if active {
                return Err(DispatchError::Conflict(format!(
                    "order {order_id} already has an active assignment"
                )));
            }
            occupied.insert(assignment_id);
        }
        Entry::Vacant(vacant) => {
            vacant.insert(assignment_id);
        }
    }
    Ok(())
}

/// Offers the assignment to the first candidate whose offer marker we win.
/// The marker compare-and-set is what keeps two coordinators from offering
/// the same driver simultaneously.
pub(crate) fn try_offer(
    state: &AppState,
    assignment: &mut Assignment,
    candidates: &[RankedCandidate],
    now: DateTime<Utc>,
) -> Option<Uuid> {
    for candidate in candidates {
        let driver_id = candidate.driver.id;
        if !state.drivers.try_mark_offered(driver_id, assignment.id, now) {
            continue;
        }

        let deadline = now + Duration::seconds(state.config.dispatch.offer_response_secs);
        assignment.status = AssignmentStatus::Offered;
        assignment.driver_id = Some(driver_id);
        assignment.offer_epoch += 1;
        assignment.offers.push(OfferRecord {
            driver_id,
            offered_at: now,
            deadline,
            outcome: OfferOutcome::Pending,
            reason: None,
            responded_at: None,
        });
        assignment.updated_at = now;

        state
            .metrics
            .offers_total
            .with_label_values(&["offered"])
            .inc();
        state.notifier.notify(
            Recipient::Driver,
            driver_id,
            "delivery_offer",
            json!({
                "assignment_id": assignment.id,
                "order_id": assignment.order_id,
                "distance_km": candidate.distance_km,
                "respond_by": deadline,
            }),
        );
        return Some(driver_id);
    }
    None
}

/// Driver-side accept/decline. Only the driver holding the open offer may
/// respond, and only before the deadline; anything else is reported stale
/// and leaves the assignment untouched.
pub fn respond_to_offer(
    state: &AppState,
    assignment_id: Uuid,
    driver_id: Uuid,
    decision: OfferDecision,
    reason: Option<String>,
) -> Result<Assignment, DispatchError> {
    if decision == OfferDecision::Decline && reason.as_deref().is_none_or(str::is_empty) {
        return Err(DispatchError::Validation(
            "decline reason is required".to_string(),
        ));
    }

    let batch_id = state
        .assignments
        .get(&assignment_id)
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id} not found")))?
        .batch_id;
    if let Some(batch_id) = batch_id {
        return batch::respond_to_batch(state, batch_id, assignment_id, driver_id, decision, reason);
    }

    let now = state.clock.now();
    let mut entry = state
        .assignments
        .get_mut(&assignment_id)
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id} not found")))?;
    let assignment = entry.value_mut();

    check_open_offer(assignment, driver_id, now)?;

    match decision {
        OfferDecision::Accept => accept_offer(state, assignment, driver_id, now)?,
        OfferDecision::Decline => {
            settle_offer_and_reoffer(state, assignment, OfferOutcome::Declined, reason, now)?
        }
    }

    Ok(assignment.clone())
}

pub(crate) fn check_open_offer(
    assignment: &Assignment,
    driver_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    if assignment.status != AssignmentStatus::Offered {
        return Err(DispatchError::StaleResponse(format!(
            "assignment is {:?}, not awaiting a response",
            assignment.status
        )));
    }
    let offer = assignment.open_offer().ok_or_else(|| {
        DispatchError::StaleResponse("no open offer on this assignment".to_string())
    })?;
    if offer.driver_id != driver_id {
        return Err(DispatchError::StaleResponse(
            "driver no longer holds the active offer".to_string(),
        ));
    }
    if now > offer.deadline {
        return Err(DispatchError::StaleResponse(
            "offer deadline has passed".to_string(),
        ));
    }
    Ok(())
}

fn accept_offer(
    state: &AppState,
    assignment: &mut Assignment,
    driver_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    let driver = state
        .drivers
        .get(driver_id)
        .ok_or_else(|| DispatchError::Internal(format!("driver {driver_id} vanished")))?;
    let order = state
        .orders
        .get(assignment.order_id)
        .ok_or_else(|| DispatchError::Internal(format!("order {} vanished", assignment.order_id)))?;

    let offer = assignment
        .open_offer_mut()
        .ok_or_else(|| DispatchError::Internal("open offer vanished".to_string()))?;
    offer.outcome = OfferOutcome::Accepted;
    offer.responded_at = Some(now);

    assignment.status = AssignmentStatus::Accepted;
    assignment.accepted_at = Some(now);
    assignment.updated_at = now;

    let route = state
        .router
        .optimize(Some(&driver.location), single_order_stops(&order))?;
    let eta = state
        .eta
        .estimate(route.total_distance_km, Some(driver.vehicle), now);
    assignment.eta = Some(eta.arrival);
    assignment.route = Some(route);

    state
        .drivers
        .set_status(driver_id, None, Some(false), None, now);
    state.drivers.clear_offer(driver_id, assignment.id, now);

    state
        .metrics
        .offers_total
        .with_label_values(&["accepted"])
        .inc();
    state.notifier.notify(
        Recipient::Customer,
        assignment.order_id,
        "driver_assigned",
        json!({
            "assignment_id": assignment.id,
            "driver": driver.name,
            "eta": assignment.eta,
        }),
    );
    state.publish(EventKind::Accepted, assignment);
    info!(assignment_id = %assignment.id, driver_id = %driver_id, "offer accepted");
    Ok(())
}

pub(crate) fn single_order_stops(order: &Order) -> Vec<RouteStop> {
    vec![
        RouteStop {
            kind: StopKind::Pickup,
            order_id: order.id,
            point: order.pickup,
        },
        RouteStop {
            kind: StopKind::Delivery,
            order_id: order.id,
            point: order.delivery,
        },
    ]
}

/// Records the decline or timeout, releases the driver, and escalates to
/// the next candidate, failing the assignment once candidates or offer
/// rounds run out. The loop is bounded: each round excludes every
/// previously offered driver.
fn settle_offer_and_reoffer(
    state: &AppState,
    assignment: &mut Assignment,
    outcome: OfferOutcome,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), DispatchError> {
    let offer = assignment
        .open_offer_mut()
        .ok_or_else(|| DispatchError::Internal("open offer vanished".to_string()))?;
    offer.outcome = outcome;
    offer.reason = reason;
    offer.responded_at = Some(now);
    let released_driver = offer.driver_id;

    state.drivers.clear_offer(released_driver, assignment.id, now);

    let (metric, event) = match outcome {
        OfferOutcome::TimedOut => ("timed_out", EventKind::TimedOut),
        _ => ("declined", EventKind::Declined),
    };
    state.metrics.offers_total.with_label_values(&[metric]).inc();
    state.publish(event, assignment);

    if assignment.offers.len() >= state.config.dispatch.max_offer_rounds as usize {
        fail_assignment(state, assignment, "offer rounds exhausted", now);
        return Ok(());
    }

    let order = state
        .orders
        .get(assignment.order_id)
        .ok_or_else(|| DispatchError::Internal(format!("order {} vanished", assignment.order_id)))?;
    let filters = CandidateFilters {
        vehicle: order.required_vehicle,
        exclude: assignment.offered_driver_ids(),
        ..Default::default()
    };
    let candidates = state.directory.find_candidates(&order.pickup, &filters, now);

    match try_offer(state, assignment, &candidates, now) {
        Some(next_driver) => {
            state.publish(EventKind::Offered, assignment);
            info!(
                assignment_id = %assignment.id,
                driver_id = %next_driver,
                round = assignment.offers.len(),
                "re-offered to next candidate"
            );
        }
        None => fail_assignment(state, assignment, "candidates exhausted", now),
    }
    Ok(())
}

pub(crate) fn fail_assignment(
    state: &AppState,
    assignment: &mut Assignment,
    cause: &str,
    now: DateTime<Utc>,
) {
    assignment.status = AssignmentStatus::Failed;
    assignment.driver_id = None;
    assignment.completed_at = Some(now);
    assignment.updated_at = now;

    state
        .metrics
        .assignments_total
        .with_label_values(&["failed"])
        .inc();
    state.metrics.active_assignments.dec();
    state.notifier.notify(
        Recipient::Customer,
        assignment.order_id,
        "assignment_failed",
        json!({ "assignment_id": assignment.id, "cause": cause }),
    );
    state.publish(EventKind::Failed, assignment);
    warn!(assignment_id = %assignment.id, cause, "assignment failed");
}

/// Externally triggered cancellation, allowed from any non-terminal state.
/// No new transitions are accepted afterwards; in-flight work is not undone.
pub fn cancel_assignment(
    state: &AppState,
    assignment_id: Uuid,
    reason: String,
) -> Result<Assignment, DispatchError> {
    let now = state.clock.now();
    let mut entry = state
        .assignments
        .get_mut(&assignment_id)
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id} not found")))?;
    let assignment = entry.value_mut();

    if assignment.status.is_terminal() {
        return Err(DispatchError::Conflict(format!(
            "assignment is already {:?}",
            assignment.status
        )));
    }

    let had_accepted = matches!(
        assignment.status,
        AssignmentStatus::Accepted
            | AssignmentStatus::EnRouteToPickup
            | AssignmentStatus::PickedUp
            | AssignmentStatus::EnRouteToDelivery
    );

    if let Some(offer) = assignment.open_offer_mut() {
        offer.outcome = OfferOutcome::Superseded;
        offer.responded_at = Some(now);
    }
    if let Some(driver_id) = assignment.driver_id {
        state.drivers.clear_offer(driver_id, assignment.id, now);
        if had_accepted {
            state.drivers.record_outcome(driver_id, 0.0, true, now);
        }
        state.notifier.notify(
            Recipient::Driver,
            driver_id,
            "delivery_cancelled",
            json!({ "assignment_id": assignment.id, "reason": reason }),
        );
    }

    assignment.status = AssignmentStatus::Cancelled;
    assignment.completed_at = Some(now);
    assignment.updated_at = now;

    state
        .metrics
        .assignments_total
        .with_label_values(&["cancelled"])
        .inc();
    state.metrics.active_assignments.dec();
    state.notifier.notify(
        Recipient::Customer,
        assignment.order_id,
        "delivery_cancelled",
        json!({ "assignment_id": assignment.id, "reason": reason }),
    );
    state.publish(EventKind::Cancelled, assignment);
    info!(assignment_id = %assignment_id, reason = %reason, "assignment cancelled");

    Ok(assignment.clone())
}

/// Driver-reported milestone progression. Illegal jumps are rejected by the
/// transition table; a driver that no longer holds the assignment is a
/// conflict.
pub fn advance_status(
    state: &AppState,
    assignment_id: Uuid,
    driver_id: Uuid,
    next: AssignmentStatus,
) -> Result<Assignment, DispatchError> {
    if !matches!(
        next,
        AssignmentStatus::EnRouteToPickup
            | AssignmentStatus::PickedUp
            | AssignmentStatus::EnRouteToDelivery
            | AssignmentStatus::Delivered
    ) {
        return Err(DispatchError::Validation(format!(
            "{next:?} is not a driver-reportable milestone"
        )));
    }

    let now = state.clock.now();
    let mut entry = state
        .assignments
        .get_mut(&assignment_id)
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id} not found")))?;
    let assignment = entry.value_mut();

    if assignment.driver_id != Some(driver_id) {
        return Err(DispatchError::Conflict(
            "driver does not hold this assignment".to_string(),
        ));
    }
    if !assignment.status.can_transition(next) {
        return Err(DispatchError::Conflict(format!(
            "illegal transition {:?} -> {next:?}",
            assignment.status
        )));
    }

    assignment.status = next;
    assignment.updated_at = now;

    if next == AssignmentStatus::Delivered {
        assignment.completed_at = Some(now);
        assignment.progress.percent_complete = 100.0;
        let distance = assignment
            .route
            .as_ref()
            .map(|route| route.total_distance_km)
            .unwrap_or(0.0);
        state.drivers.record_outcome(driver_id, distance, false, now);
        state
            .metrics
            .assignments_total
            .with_label_values(&["delivered"])
            .inc();
        state.metrics.active_assignments.dec();
        state.notifier.notify(
            Recipient::Customer,
            assignment.order_id,
            "order_delivered",
            json!({ "assignment_id": assignment.id }),
        );
        state.publish(EventKind::Delivered, assignment);
    } else {
        state.notifier.notify(
            Recipient::Customer,
            assignment.order_id,
            "delivery_status",
            json!({ "assignment_id": assignment.id, "status": next }),
        );
        state.publish(EventKind::StatusChanged, assignment);
    }

    Ok(assignment.clone())
}

/// One pass of the deadline sweep: every offered assignment past its
/// response deadline is settled exactly like an implicit decline with
/// reason "timeout". Returns how many offers expired.
pub fn sweep_expired_offers(state: &AppState) -> usize {
    let now = state.clock.now();
    let expired: Vec<(Uuid, Option<Uuid>)> = state
        .assignments
        .iter()
        .filter(|entry| {
            let a = entry.value();
            a.status == AssignmentStatus::Offered
                && a.open_offer().is_some_and(|offer| now > offer.deadline)
        })
        .map(|entry| (*entry.key(), entry.value().batch_id))
        .collect();

    let mut swept = 0;
    for (assignment_id, batch_id) in expired {
        if let Some(batch_id) = batch_id {
            swept += batch::timeout_batch(state, batch_id, now);
            continue;
        }

        let Some(mut entry) = state.assignments.get_mut(&assignment_id) else {
            continue;
        };
        let assignment = entry.value_mut();
        // Re-check under the entry lock: a respond may have won the race.
        if assignment.status != AssignmentStatus::Offered
            || assignment.open_offer().is_none_or(|offer| now <= offer.deadline)
        {
            continue;
        }
        if let Err(err) = settle_offer_and_reoffer(
            state,
            assignment,
            OfferOutcome::TimedOut,
            Some("timeout".to_string()),
            now,
        ) {
            warn!(assignment_id = %assignment_id, error = %err, "sweep failed to settle offer");
        }
        swept += 1;
    }
    swept
}

/// Background task enforcing offer deadlines. The only user-facing timeout
/// in the engine; respond callers are never blocked on it.
pub async fn run_deadline_sweep(state: Arc<AppState>) {
    let period = tokio::time::Duration::from_secs(state.config.dispatch.sweep_interval_secs);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(period_secs = period.as_secs(), "deadline sweep started");
    loop {
        ticker.tick().await;
        let swept = sweep_expired_offers(&state);
        if swept > 0 {
            info!(swept, "expired offers re-dispatched");
        }
    }
}
