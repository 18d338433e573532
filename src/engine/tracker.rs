use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::geo::{haversine_km, project_onto_route, route_length_km, GeoPoint};
use crate::models::assignment::{
    Assignment, AssignmentStatus, DeliveryException, DeliveryProgress, ExceptionKind,
};
use crate::models::tracking::TrackingEvent;
use crate::state::{AppState, EventKind};

fn is_trackable(status: AssignmentStatus) -> bool {
    matches!(
        status,
        AssignmentStatus::Accepted
            | AssignmentStatus::EnRouteToPickup
            | AssignmentStatus::PickedUp
            | AssignmentStatus::EnRouteToDelivery
    )
}

fn is_moving_leg(status: AssignmentStatus) -> bool {
    matches!(
        status,
        AssignmentStatus::EnRouteToPickup | AssignmentStatus::EnRouteToDelivery
    )
}

/// Ingests one location ping: appends the immutable tracking event,
/// recomputes percent-complete along the planned route, and raises
/// exceptions for anomalies. Exceptions flag the assignment for operator
/// attention; they never move the state machine.
pub fn ingest_location(
    state: &AppState,
    assignment_id: Uuid,
    point: GeoPoint,
    at: Option<DateTime<Utc>>,
) -> Result<DeliveryProgress, DispatchError> {
    if !point.is_valid() {
        return Err(DispatchError::Validation(
            "coordinates out of range".to_string(),
        ));
    }

    let now = at.unwrap_or_else(|| state.clock.now());
    let mut entry = state
        .assignments
        .get_mut(&assignment_id)
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id} not found")))?;
    let assignment = entry.value_mut();

    if !is_trackable(assignment.status) {
        return Err(DispatchError::Conflict(format!(
            "assignment is {:?}; location updates are not accepted",
            assignment.status
        )));
    }
    let Some(route) = assignment.route.clone() else {
        return Err(DispatchError::Conflict(
            "assignment has no route plan yet".to_string(),
        ));
    };

    state
        .tracking
        .entry(assignment_id)
        .or_default()
        .push(TrackingEvent {
            assignment_id,
            point,
            recorded_at: now,
        });

    let waypoints = route.waypoints();
    let projection = project_onto_route(&waypoints, &point)
        .ok_or_else(|| DispatchError::Internal("route has no waypoints".to_string()))?;
    // Percent-complete is measured over the stop polyline; the driver's
    // approach leg to the first stop is not part of it.
    let total_km = route_length_km(&waypoints).max(1e-9);
    let raw_percent = (projection.traveled_km / total_km * 100.0).clamp(0.0, 100.0);

    let off_route = projection.deviation_km > state.config.dispatch.off_route_threshold_km;
    if off_route {
        // Raise only on the crossing, not on every ping while deviated.
        let was_off_route = assignment.progress.last_position.is_some_and(|prev| {
            project_onto_route(&waypoints, &prev)
                .is_some_and(|p| p.deviation_km > state.config.dispatch.off_route_threshold_km)
        });
        if !was_off_route {
            record_exception(
                state,
                assignment,
                ExceptionKind::OffRoute,
                format!("{:.2} km off the planned route", projection.deviation_km),
                now,
            );
        }
    }

    // GPS noise may nudge the projection backwards; progress only moves
    // forward unless the driver genuinely left the route.
    assignment.progress.percent_complete = if off_route {
        raw_percent
    } else {
        raw_percent.max(assignment.progress.percent_complete)
    };

    let moved_km = assignment
        .progress
        .last_position
        .map(|prev| haversine_km(&prev, &point));
    match moved_km {
        Some(moved) if moved < state.config.dispatch.stall_distance_km => {
            let stalled_since = assignment.progress.last_moved_at.unwrap_or(now);
            let window = Duration::seconds(state.config.dispatch.stall_window_secs);
            let already_raised = assignment
                .exceptions
                .iter()
                .any(|e| e.kind == ExceptionKind::Stalled && e.detected_at >= stalled_since);
            if is_moving_leg(assignment.status) && now - stalled_since > window && !already_raised {
                record_exception(
                    state,
                    assignment,
                    ExceptionKind::Stalled,
                    format!("no movement since {stalled_since}"),
                    now,
                );
            }
        }
        _ => assignment.progress.last_moved_at = Some(now),
    }

    if let Some(eta) = assignment.eta {
        let grace = Duration::minutes(state.config.dispatch.eta_grace_mins);
        let already_raised = assignment
            .exceptions
            .iter()
            .any(|e| e.kind == ExceptionKind::MissedWindow);
        if now > eta + grace && !already_raised {
            record_exception(
                state,
                assignment,
                ExceptionKind::MissedWindow,
                format!("past ETA {eta} beyond grace"),
                now,
            );
        }
    }

    assignment.progress.last_position = Some(point);
    assignment.progress.last_update_at = Some(now);
    assignment.updated_at = now;

    state.publish(EventKind::Progress, assignment);
    Ok(assignment.progress.clone())
}

/// Operator- or system-reported exception, distinct from the automatic
/// detections. Always recorded, never silently dropped.
pub fn report_exception(
    state: &AppState,
    assignment_id: Uuid,
    kind: ExceptionKind,
    details: String,
) -> Result<Assignment, DispatchError> {
    let now = state.clock.now();
    let mut entry = state
        .assignments
        .get_mut(&assignment_id)
        .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id} not found")))?;
    let assignment = entry.value_mut();

    record_exception(state, assignment, kind, details, now);
    Ok(assignment.clone())
}

fn record_exception(
    state: &AppState,
    assignment: &mut Assignment,
    kind: ExceptionKind,
    details: String,
    now: DateTime<Utc>,
) {
    assignment.exceptions.push(DeliveryException {
        kind,
        detected_at: now,
        details: details.clone(),
    });
    state
        .metrics
        .exceptions_total
        .with_label_values(&[kind_label(kind)])
        .inc();
    state.notifier.notify(
        crate::notify::Recipient::Customer,
        assignment.order_id,
        "delivery_exception",
        json!({ "assignment_id": assignment.id, "kind": kind, "details": details }),
    );
    state.publish(EventKind::Exception, assignment);
    warn!(
        assignment_id = %assignment.id,
        kind = kind_label(kind),
        details = %details,
        "delivery exception recorded"
    );
}

fn kind_label(kind: ExceptionKind) -> &'static str {
    match kind {
        ExceptionKind::Stalled => "stalled",
        ExceptionKind::OffRoute => "off_route",
        ExceptionKind::MissedWindow => "missed_window",
        ExceptionKind::FailedHandoff => "failed_handoff",
        ExceptionKind::Delayed => "delayed",
    }
}
