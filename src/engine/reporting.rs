use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::assignment::{Assignment, AssignmentStatus};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportFilters {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub driver_id: Option<Uuid>,
    pub status: Option<AssignmentStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverKpis {
    pub driver_id: Uuid,
    pub completed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KpiReport {
    pub total_assignments: usize,
    pub delivered: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Share of deliveries that arrived before ETA plus the grace period,
    /// over deliveries that had an ETA to measure against.
    pub on_time_rate: f64,
    pub average_delivery_minutes: Option<f64>,
    pub per_driver: Vec<DriverKpis>,
}

/// Rolls up historical assignment records into KPIs. Read-only: works on
/// snapshots and never mutates the source records.
pub fn generate_report(state: &AppState, filters: &ReportFilters) -> KpiReport {
    let grace = Duration::minutes(state.config.dispatch.eta_grace_mins);

    let selected: Vec<Assignment> = state
        .assignments
        .iter()
        .map(|entry| entry.value().clone())
        .filter(|a| filters.from.is_none_or(|from| a.created_at >= from))
        .filter(|a| filters.to.is_none_or(|to| a.created_at <= to))
        .filter(|a| filters.driver_id.is_none_or(|d| a.driver_id == Some(d)))
        .filter(|a| filters.status.is_none_or(|s| a.status == s))
        .collect();

    let delivered: Vec<&Assignment> = selected
        .iter()
        .filter(|a| a.status == AssignmentStatus::Delivered)
        .collect();
    let failed = selected
        .iter()
        .filter(|a| a.status == AssignmentStatus::Failed)
        .count();
    let cancelled = selected
        .iter()
        .filter(|a| a.status == AssignmentStatus::Cancelled)
        .count();

    let mut measurable = 0usize;
    let mut on_time = 0usize;
    for a in &delivered {
        let (Some(eta), Some(completed_at)) = (a.eta, a.completed_at) else {
            continue;
        };
        measurable += 1;
        if completed_at <= eta + grace {
            on_time += 1;
        }
    }
    let on_time_rate = if measurable == 0 {
        0.0
    } else {
        on_time as f64 / measurable as f64
    };

    let durations: Vec<f64> = delivered
        .iter()
        .filter_map(|a| {
            a.completed_at
                .map(|done| (done - a.created_at).num_seconds() as f64 / 60.0)
        })
        .collect();
    let average_delivery_minutes = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<f64>() / durations.len() as f64)
    };

    let mut per_driver: Vec<DriverKpis> = Vec::new();
    for a in &selected {
        let Some(driver_id) = a.driver_id else {
            continue;
        };
        let bucket = match per_driver.iter_mut().find(|k| k.driver_id == driver_id) {
            Some(bucket) => bucket,
            None => {
                per_driver.push(DriverKpis {
                    driver_id,
                    completed: 0,
                    cancelled: 0,
                });
                per_driver.last_mut().expect("just pushed")
            }
        };
        match a.status {
            AssignmentStatus::Delivered => bucket.completed += 1,
            AssignmentStatus::Cancelled => bucket.cancelled += 1,
            _ => {}
        }
    }
    per_driver.sort_by_key(|k| k.driver_id);

    KpiReport {
        total_assignments: selected.len(),
        delivered: delivered.len(),
        failed,
        cancelled,
        on_time_rate,
        average_delivery_minutes,
        per_driver,
    }
}
