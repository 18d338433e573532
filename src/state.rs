use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::directory::DriverDirectory;
use crate::engine::eta::EtaCalculator;
use crate::engine::routing::RouteOptimizer;
use crate::models::assignment::Assignment;
use crate::models::batch::Batch;
use crate::models::tracking::TrackingEvent;
use crate::notify::{LogNotifier, Notifier};
use crate::observability::metrics::Metrics;
use crate::store::{DriverStore, InMemoryDriverStore, InMemoryOrderStore, OrderStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Offered,
    Accepted,
    Declined,
    TimedOut,
    StatusChanged,
    Progress,
    Exception,
    Cancelled,
    Failed,
    Delivered,
}

/// Snapshot pushed to websocket subscribers on every assignment transition.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEvent {
    pub kind: EventKind,
    pub assignment: Assignment,
}

pub struct AppState {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub drivers: Arc<dyn DriverStore>,
    pub orders: Arc<dyn OrderStore>,
    pub notifier: Arc<dyn Notifier>,
    pub assignments: DashMap<Uuid, Assignment>,
    /// Order id -> assignment id; guards the one-active-assignment rule.
    pub assignments_by_order: DashMap<Uuid, Uuid>,
    pub batches: DashMap<Uuid, Batch>,
    /// Append-only location history per assignment.
    pub tracking: DashMap<Uuid, Vec<TrackingEvent>>,
    pub directory: DriverDirectory,
    pub router: RouteOptimizer,
    pub eta: EtaCalculator,
    pub events_tx: broadcast::Sender<DispatchEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_deps(
            config,
            Arc::new(SystemClock),
            Arc::new(InMemoryDriverStore::new()),
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(LogNotifier),
        )
    }

    /// Wiring point for tests: manual clock, fake stores, recording
    /// notifier.
    pub fn with_deps(
        config: Config,
        clock: Arc<dyn Clock>,
        drivers: Arc<dyn DriverStore>,
        orders: Arc<dyn OrderStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let directory = DriverDirectory::new(drivers.clone(), config.dispatch.clone());
        let router = RouteOptimizer::new(config.dispatch.minutes_per_km);
        let eta = EtaCalculator::new(config.dispatch.clone());

        Self {
            config,
            clock,
            drivers,
            orders,
            notifier,
            assignments: DashMap::new(),
            assignments_by_order: DashMap::new(),
            batches: DashMap::new(),
            tracking: DashMap::new(),
            directory,
            router,
            eta,
            events_tx,
            metrics: Metrics::new(),
        }
    }

    pub fn publish(&self, kind: EventKind, assignment: &Assignment) {
        let _ = self.events_tx.send(DispatchEvent {
            kind,
            assignment: assignment.clone(),
        });
    }
}
