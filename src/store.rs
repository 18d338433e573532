use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::driver::{Driver, WorkingZone};
use crate::models::order::Order;

/// Driver persistence boundary. The engine only sees this trait; production
/// wiring and tests both use the in-memory implementation below.
pub trait DriverStore: Send + Sync {
    fn insert(&self, driver: Driver);
    fn get(&self, id: Uuid) -> Option<Driver>;
    fn list_available(&self) -> Vec<Driver>;
    fn set_location(&self, id: Uuid, point: GeoPoint, now: DateTime<Utc>) -> Option<Driver>;
    fn set_status(
        &self,
        id: Uuid,
        online: Option<bool>,
        available: Option<bool>,
        active: Option<bool>,
        now: DateTime<Utc>,
    ) -> Option<Driver>;
    fn add_zone(&self, id: Uuid, zone: WorkingZone, now: DateTime<Utc>) -> Option<Driver>;

    /// Compare-and-set of the driver's open-offer marker. Succeeds only if
    /// the driver can serve and holds no other open offer, so two
    /// coordinators can never offer the same driver at once.
    fn try_mark_offered(&self, id: Uuid, assignment_id: Uuid, now: DateTime<Utc>) -> bool;

    /// Clears the marker, but only if it still points at `assignment_id`.
    fn clear_offer(&self, id: Uuid, assignment_id: Uuid, now: DateTime<Utc>);

    fn record_outcome(
        &self,
        id: Uuid,
        distance_km: f64,
        cancelled: bool,
        now: DateTime<Utc>,
    ) -> Option<Driver>;
}

/// Order persistence boundary; orders are consumed, not owned.
pub trait OrderStore: Send + Sync {
    fn insert(&self, order: Order);
    fn get(&self, id: Uuid) -> Option<Order>;
    fn get_many(&self, ids: &[Uuid]) -> Vec<Order>;
}

#[derive(Debug, Default)]
pub struct InMemoryDriverStore {
    drivers: DashMap<Uuid, Driver>,
}

impl InMemoryDriverStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn all(&self) -> Vec<Driver> {
        self.drivers.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl DriverStore for InMemoryDriverStore {
    fn insert(&self, driver: Driver) {
        self.drivers.insert(driver.id, driver);
    }

    fn get(&self, id: Uuid) -> Option<Driver> {
        self.drivers.get(&id).map(|entry| entry.value().clone())
    }

    fn list_available(&self) -> Vec<Driver> {
        self.drivers
            .iter()
            .filter(|entry| entry.value().can_serve())
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn set_location(&self, id: Uuid, point: GeoPoint, now: DateTime<Utc>) -> Option<Driver> {
        let mut driver = self.drivers.get_mut(&id)?;
        driver.location = point;
        driver.updated_at = now;
        Some(driver.clone())
    }

    fn set_status(
        &self,
        id: Uuid,
        online: Option<bool>,
        available: Option<bool>,
        active: Option<bool>,
        now: DateTime<Utc>,
    ) -> Option<Driver> {
        let mut driver = self.drivers.get_mut(&id)?;
        if let Some(online) = online {
            driver.is_online = online;
        }
        if let Some(available) = available {
            if available && !driver.is_available {
                driver.idle_since = now;
            }
            driver.is_available = available;
        }
        if let Some(active) = active {
            driver.is_active = active;
        }
        driver.updated_at = now;
        Some(driver.clone())
    }

    fn add_zone(&self, id: Uuid, zone: WorkingZone, now: DateTime<Utc>) -> Option<Driver> {
        let mut driver = self.drivers.get_mut(&id)?;
        driver.zones.push(zone);
        driver.updated_at = now;
        Some(driver.clone())
    }

    fn try_mark_offered(&self, id: Uuid, assignment_id: Uuid, now: DateTime<Utc>) -> bool {
        let Some(mut driver) = self.drivers.get_mut(&id) else {
            return false;
        };
        if !driver.can_serve() {
            return false;
        }
        driver.current_offer = Some(assignment_id);
        driver.updated_at = now;
        true
    }

    fn clear_offer(&self, id: Uuid, assignment_id: Uuid, now: DateTime<Utc>) {
        if let Some(mut driver) = self.drivers.get_mut(&id) {
            if driver.current_offer == Some(assignment_id) {
                driver.current_offer = None;
                driver.updated_at = now;
            }
        }
    }

    fn record_outcome(
        &self,
        id: Uuid,
        distance_km: f64,
        cancelled: bool,
        now: DateTime<Utc>,
    ) -> Option<Driver> {
        let mut driver = self.drivers.get_mut(&id)?;
        if cancelled {
            driver.stats.cancelled += 1;
        } else {
            driver.stats.completed += 1;
            driver.stats.total_distance_km += distance_km;
        }
        driver.is_available = true;
        driver.idle_since = now;
        driver.updated_at = now;
        Some(driver.clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<Uuid, Order>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    fn get(&self, id: Uuid) -> Option<Order> {
        self.orders.get(&id).map(|entry| entry.value().clone())
    }

    fn get_many(&self, ids: &[Uuid]) -> Vec<Order> {
        ids.iter().filter_map(|id| self.get(*id)).collect()
    }
}
