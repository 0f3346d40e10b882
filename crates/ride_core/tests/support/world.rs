#![allow(dead_code)]

use std::sync::Arc;

use ride_core::clock::ManualClock;
use ride_core::config::{ProximityPolicy, ServiceConfig};
use ride_core::drivers::{DriverStore, InMemoryDriverStore};
use ride_core::fare::RideType;
use ride_core::geo::{GeoIndex, H3GeoIndex, LatLon};
use ride_core::ride::RideRequest;
use ride_core::store::{InMemoryRideStore, RideRequestStore};
use ride_core::test_helpers::{online_driver, request_trip, test_pickup, TEST_START_MS};
use ride_core::{Actor, RideService};

/// A service plus the clock that drives it.
pub struct TestService {
    pub service: RideService,
    pub clock: ManualClock,
}

impl TestService {
    /// Verified driver reporting from `km` east of the test pickup.
    pub fn driver_east(&self, id: &str, km: f64) -> Actor {
        online_driver(&self.service, id, test_pickup().offset(90.0, km)).expect("online driver")
    }

    /// Verified driver reporting from an arbitrary position.
    pub fn driver_at(&self, id: &str, position: LatLon) -> Actor {
        online_driver(&self.service, id, position).expect("online driver")
    }

    /// Car ride from the test pickup to a point `trip_km` north.
    pub fn car_ride(&self, rider: &Actor, trip_km: f64) -> RideRequest {
        request_trip(&self.service, rider, test_pickup(), trip_km, RideType::Car)
            .expect("request ride")
    }

    /// Drive an accepted ride through arrival, start and completion.
    pub fn finish(&self, driver: &Actor, ride: &RideRequest) -> RideRequest {
        self.service.mark_arrived(driver, &ride.id).expect("arrived");
        self.service.start_ride(driver, &ride.id).expect("start");
        self.service.complete_ride(driver, &ride.id).expect("complete")
    }
}

/// Builder for services used in integration tests.
#[derive(Default)]
pub struct TestServiceBuilder {
    config: ServiceConfig,
    driver_store: Option<Arc<dyn DriverStore>>,
    ride_store: Option<Arc<dyn RideRequestStore>>,
}

impl TestServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_staleness_secs(mut self, secs: u64) -> Self {
        self.config = self.config.with_staleness_secs(secs);
        self
    }

    pub fn with_proximity_policy(mut self, policy: ProximityPolicy) -> Self {
        self.config = self.config.with_proximity_policy(policy);
        self
    }

    /// Replace the driver registry, e.g. with a fault-injecting wrapper.
    pub fn with_driver_store(mut self, store: Arc<dyn DriverStore>) -> Self {
        self.driver_store = Some(store);
        self
    }

    /// Share a ride store with the test so it can write behind the service's back.
    pub fn with_ride_store(mut self, store: Arc<dyn RideRequestStore>) -> Self {
        self.ride_store = Some(store);
        self
    }

    pub fn build(self) -> TestService {
        let timeout = self.config.store.operation_timeout();
        let clock = ManualClock::new(TEST_START_MS);
        let rides: Arc<dyn RideRequestStore> = match self.ride_store {
            Some(store) => store,
            None => Arc::new(InMemoryRideStore::new(timeout)),
        };
        let drivers: Arc<dyn DriverStore> = match self.driver_store {
            Some(store) => store,
            None => Arc::new(InMemoryDriverStore::new(timeout)),
        };
        let geo: Arc<dyn GeoIndex> = Arc::new(H3GeoIndex::new(h3o::Resolution::Seven, timeout));
        let service =
            RideService::with_stores(self.config, Arc::new(clock.clone()), rides, drivers, geo)
                .expect("valid test config");
        TestService { service, clock }
    }
}
