//! Driver registry: verification flag, current ride binding and earnings.
//!
//! [`DriverStore::compare_and_set_ride`] is the per-driver serialization point that
//! keeps a driver on at most one ride at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::sync::{lock_within, read_within, write_within};
use crate::types::{DriverId, RideId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub driver_id: DriverId,
    /// Set by the external onboarding flow once documents are checked.
    pub verified: bool,
    pub current_ride: Option<RideId>,
    pub total_earnings: f64,
    pub trips_completed: u64,
    pub registered_at_ms: u64,
}

impl DriverRecord {
    pub fn is_free(&self) -> bool {
        self.current_ride.is_none()
    }
}

/// Outcome of [`DriverStore::finish_ride`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// Binding released (and earnings credited, if any were given).
    Released,
    /// The driver was not bound to that ride; nothing changed.
    NotBound,
}

pub trait DriverStore: Send + Sync {
    fn register(
        &self,
        driver_id: &DriverId,
        verified: bool,
        registered_at_ms: u64,
    ) -> DispatchResult<DriverRecord>;

    fn get(&self, driver_id: &DriverId) -> DispatchResult<DriverRecord>;

    fn set_verified(&self, driver_id: &DriverId, verified: bool) -> DispatchResult<DriverRecord>;

    /// Atomically replace the driver's current ride if it still equals `expected`.
    /// Fails with `DriverBusy` when the binding changed underneath the caller.
    fn compare_and_set_ride(
        &self,
        driver_id: &DriverId,
        expected: Option<&RideId>,
        new: Option<RideId>,
    ) -> DispatchResult<DriverRecord>;

    /// Release the binding to `ride_id` and credit `earnings`, in one write. Only acts
    /// while the driver is still bound to `ride_id`, so replays credit nothing.
    fn finish_ride(
        &self,
        driver_id: &DriverId,
        ride_id: &RideId,
        earnings: Option<f64>,
    ) -> DispatchResult<FinishOutcome>;
}

/// In-memory [`DriverStore`] with one lock per driver.
pub struct InMemoryDriverStore {
    drivers: RwLock<HashMap<DriverId, Arc<Mutex<DriverRecord>>>>,
    timeout: Duration,
}

impl InMemoryDriverStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    fn entry(&self, driver_id: &DriverId) -> DispatchResult<Arc<Mutex<DriverRecord>>> {
        let drivers = read_within(&self.drivers, self.timeout, "driver lookup")?;
        drivers
            .get(driver_id)
            .cloned()
            .ok_or_else(|| DispatchError::DriverNotFound(driver_id.clone()))
    }
}

impl Default for InMemoryDriverStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl DriverStore for InMemoryDriverStore {
    fn register(
        &self,
        driver_id: &DriverId,
        verified: bool,
        registered_at_ms: u64,
    ) -> DispatchResult<DriverRecord> {
        let mut drivers = write_within(&self.drivers, self.timeout, "driver register")?;
        if drivers.contains_key(driver_id) {
            return Err(DispatchError::DriverExists(driver_id.clone()));
        }
        let record = DriverRecord {
            driver_id: driver_id.clone(),
            verified,
            current_ride: None,
            total_earnings: 0.0,
            trips_completed: 0,
            registered_at_ms,
        };
        drivers.insert(driver_id.clone(), Arc::new(Mutex::new(record.clone())));
        Ok(record)
    }

    fn get(&self, driver_id: &DriverId) -> DispatchResult<DriverRecord> {
        let entry = self.entry(driver_id)?;
        let record = lock_within(&entry, self.timeout, "driver get")?;
        Ok(record.clone())
    }

    fn set_verified(&self, driver_id: &DriverId, verified: bool) -> DispatchResult<DriverRecord> {
        let entry = self.entry(driver_id)?;
        let mut record = lock_within(&entry, self.timeout, "driver verify")?;
        record.verified = verified;
        Ok(record.clone())
    }

    fn compare_and_set_ride(
        &self,
        driver_id: &DriverId,
        expected: Option<&RideId>,
        new: Option<RideId>,
    ) -> DispatchResult<DriverRecord> {
        let entry = self.entry(driver_id)?;
        let mut record = lock_within(&entry, self.timeout, "driver compare-and-set")?;
        if record.current_ride.as_ref() != expected {
            return Err(DispatchError::DriverBusy {
                driver_id: driver_id.clone(),
            });
        }
        record.current_ride = new;
        Ok(record.clone())
    }

    fn finish_ride(
        &self,
        driver_id: &DriverId,
        ride_id: &RideId,
        earnings: Option<f64>,
    ) -> DispatchResult<FinishOutcome> {
        let entry = self.entry(driver_id)?;
        let mut record = lock_within(&entry, self.timeout, "driver finish")?;
        if record.current_ride.as_ref() != Some(ride_id) {
            return Ok(FinishOutcome::NotBound);
        }
        record.current_ride = None;
        if let Some(amount) = earnings {
            record.total_earnings += amount;
            record.trips_completed += 1;
        }
        Ok(FinishOutcome::Released)
    }
}
