#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use ride_core::drivers::{DriverRecord, DriverStore, FinishOutcome, InMemoryDriverStore};
use ride_core::types::{DriverId, RideId};
use ride_core::{DispatchError, DispatchResult};

type Hook = Box<dyn FnOnce() + Send>;

/// Driver registry wrapper that can fail or interleave work with ride binding.
#[derive(Default)]
pub struct FaultyDriverStore {
    inner: InMemoryDriverStore,
    fail_binds: AtomicBool,
    fail_finishes: AtomicBool,
    bind_attempts: AtomicUsize,
    before_bind: Mutex<Option<Hook>>,
}

impl FaultyDriverStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `None -> Some(ride)` binding time out.
    pub fn fail_binds(&self, fail: bool) {
        self.fail_binds.store(fail, Ordering::SeqCst);
    }

    /// Make `finish_ride` time out.
    pub fn fail_finishes(&self, fail: bool) {
        self.fail_finishes.store(fail, Ordering::SeqCst);
    }

    /// Run `hook` once, right before the next binding is written.
    pub fn before_next_bind(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_bind.lock().expect("hook lock") = Some(Box::new(hook));
    }

    pub fn bind_attempts(&self) -> usize {
        self.bind_attempts.load(Ordering::SeqCst)
    }

    fn timeout(operation: &'static str) -> DispatchError {
        DispatchError::Timeout {
            operation,
            timeout_ms: 0,
        }
    }
}

impl DriverStore for FaultyDriverStore {
    fn register(
        &self,
        driver_id: &DriverId,
        verified: bool,
        registered_at_ms: u64,
    ) -> DispatchResult<DriverRecord> {
        self.inner.register(driver_id, verified, registered_at_ms)
    }

    fn get(&self, driver_id: &DriverId) -> DispatchResult<DriverRecord> {
        self.inner.get(driver_id)
    }

    fn set_verified(&self, driver_id: &DriverId, verified: bool) -> DispatchResult<DriverRecord> {
        self.inner.set_verified(driver_id, verified)
    }

    fn compare_and_set_ride(
        &self,
        driver_id: &DriverId,
        expected: Option<&RideId>,
        new: Option<RideId>,
    ) -> DispatchResult<DriverRecord> {
        if new.is_some() {
            self.bind_attempts.fetch_add(1, Ordering::SeqCst);
            let hook = self.before_bind.lock().expect("hook lock").take();
            if let Some(hook) = hook {
                hook();
            }
            if self.fail_binds.load(Ordering::SeqCst) {
                return Err(Self::timeout("driver compare-and-set"));
            }
        }
        self.inner.compare_and_set_ride(driver_id, expected, new)
    }

    fn finish_ride(
        &self,
        driver_id: &DriverId,
        ride_id: &RideId,
        earnings: Option<f64>,
    ) -> DispatchResult<FinishOutcome> {
        if self.fail_finishes.load(Ordering::SeqCst) {
            return Err(Self::timeout("driver finish"));
        }
        self.inner.finish_ride(driver_id, ride_id, earnings)
    }
}
