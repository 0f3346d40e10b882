//! Test helpers for common test setup and utilities.
//!
//! This module provides shared fixtures (a reference pickup point, a service on a
//! manual clock, online drivers) so tests, benches and demos set up rides the same way.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::ManualClock;
use crate::config::ServiceConfig;
use crate::error::{ConfigError, DispatchResult};
use crate::fare::RideType;
use crate::geo::LatLon;
use crate::ride::{NewRideRequest, RideRequest};
use crate::service::RideService;
use crate::types::Actor;

/// Reference pickup point used across tests (Islamabad, Pakistan).
pub const TEST_PICKUP: (f64, f64) = (33.6844, 73.0479);

/// Start time of the manual clock, well after the Unix epoch.
pub const TEST_START_MS: u64 = 1_700_000_000_000;

pub fn test_pickup() -> LatLon {
    LatLon {
        lat: TEST_PICKUP.0,
        lon: TEST_PICKUP.1,
    }
}

/// Service over in-memory stores driven by a [`ManualClock`] the caller advances.
pub fn manual_service(config: ServiceConfig) -> Result<(RideService, ManualClock), ConfigError> {
    let clock = ManualClock::new(TEST_START_MS);
    let service = RideService::in_memory_with_clock(config, Arc::new(clock.clone()))?;
    Ok((service, clock))
}

/// Register a verified driver and report its first position.
pub fn online_driver(service: &RideService, id: &str, position: LatLon) -> DispatchResult<Actor> {
    let actor = Actor::driver(id);
    service.register_driver(&actor.id, true)?;
    service.report_location(&actor, position.lat, position.lon)?;
    Ok(actor)
}

/// Submit a ride from `pickup` to a destination `trip_km` due north.
pub fn request_trip(
    service: &RideService,
    rider: &Actor,
    pickup: LatLon,
    trip_km: f64,
    ride_type: RideType,
) -> DispatchResult<RideRequest> {
    let request = NewRideRequest::new(
        rider.id.clone(),
        pickup,
        pickup.offset(0.0, trip_km),
        ride_type,
    );
    service.request_ride(rider, request)
}

/// `count` reproducible positions uniformly spread within `max_km` of `center`.
pub fn scatter_positions(center: LatLon, count: usize, max_km: f64, seed: u64) -> Vec<LatLon> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let bearing = rng.gen_range(0.0..360.0);
            // sqrt keeps the density uniform over the disk area
            let distance = max_km * rng.gen::<f64>().sqrt();
            center.offset(bearing, distance)
        })
        .collect()
}
