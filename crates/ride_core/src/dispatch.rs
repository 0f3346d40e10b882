//! Dispatch: surfaces open requests to nearby idle drivers and arbitrates acceptance.
//!
//! Acceptance binds a ride and a driver through two compare-and-set writes:
//!
//! 1. ride `searching -> accepted` with the driver assigned
//! 2. driver `current_ride: None -> ride`
//!
//! If step 2 fails the ride is moved back to `searching` with its driver cleared
//! and the caller gets `AssignmentFailed`. After step 2 the ride is re-read: a
//! cancel that slipped between the two writes could not release a binding that
//! did not exist yet, so the release happens here.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::drivers::{DriverStore, FinishOutcome};
use crate::error::{DispatchError, DispatchResult};
use crate::geo::{GeoIndex, NearbyFilter};
use crate::ride::{RideMutation, RideRequest, RideStatus};
use crate::store::RideRequestStore;
use crate::types::{DriverId, RideId};

/// A driver a request may be offered to. Advisory: holding a candidate reserves nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub distance_km: f64,
    pub reported_at_ms: u64,
}

pub struct DispatchEngine {
    rides: Arc<dyn RideRequestStore>,
    drivers: Arc<dyn DriverStore>,
    geo: Arc<dyn GeoIndex>,
    config: DispatchConfig,
    staleness_ms: u64,
}

impl DispatchEngine {
    pub fn new(
        rides: Arc<dyn RideRequestStore>,
        drivers: Arc<dyn DriverStore>,
        geo: Arc<dyn GeoIndex>,
        config: DispatchConfig,
        staleness_ms: u64,
    ) -> Self {
        Self {
            rides,
            drivers,
            geo,
            config,
            staleness_ms,
        }
    }

    /// Fresh, idle, verified and unbound drivers near the pickup, nearest first.
    ///
    /// A request that is no longer `searching` has no candidates.
    pub fn find_candidates(
        &self,
        ride_id: &RideId,
        radius_km: Option<f64>,
        now_ms: u64,
    ) -> DispatchResult<Vec<Candidate>> {
        let ride = self.rides.get(ride_id)?;
        if ride.status != RideStatus::Searching {
            debug!(ride_id = %ride_id, status = ?ride.status, "Ride no longer searching");
            return Ok(Vec::new());
        }
        let radius_km = radius_km.unwrap_or(self.config.candidate_radius_km);
        let nearby = self.geo.query_nearby(
            ride.pickup,
            radius_km,
            NearbyFilter::idle(now_ms, self.staleness_ms),
        )?;

        let mut candidates = Vec::new();
        for driver in nearby {
            if candidates.len() >= self.config.max_candidates {
                break;
            }
            let record = match self.drivers.get(&driver.driver_id) {
                Ok(record) => record,
                Err(DispatchError::DriverNotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if !record.verified || !record.is_free() {
                continue;
            }
            candidates.push(Candidate {
                driver_id: driver.driver_id,
                distance_km: driver.distance_km,
                reported_at_ms: driver.location.updated_at_ms,
            });
        }
        debug!(ride_id = %ride_id, radius_km, found = candidates.len(), "Candidates found");
        Ok(candidates)
    }

    /// Bind `driver_id` to `ride_id`. Exactly one of any set of concurrent callers wins;
    /// the rest get `AlreadyTaken`. Never retried internally.
    pub fn accept(
        &self,
        ride_id: &RideId,
        driver_id: &DriverId,
        now_ms: u64,
    ) -> DispatchResult<RideRequest> {
        let driver = self.drivers.get(driver_id)?;
        if !driver.verified {
            return Err(DispatchError::DriverNotVerified(driver_id.clone()));
        }
        if !driver.is_free() {
            return Err(DispatchError::DriverBusy {
                driver_id: driver_id.clone(),
            });
        }

        let accepted = match self.rides.compare_and_set_status(
            ride_id,
            RideStatus::Searching,
            RideStatus::Accepted,
            RideMutation::at(now_ms).assign_driver(driver_id.clone()),
        ) {
            Ok(ride) => ride,
            Err(DispatchError::Conflict { actual, .. }) => {
                debug!(ride_id = %ride_id, driver_id = %driver_id, ?actual, "Accept lost");
                return Err(if actual.is_terminal() {
                    DispatchError::AlreadyTerminal {
                        ride_id: ride_id.clone(),
                        status: actual,
                    }
                } else {
                    DispatchError::AlreadyTaken(ride_id.clone())
                });
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self
            .drivers
            .compare_and_set_ride(driver_id, None, Some(ride_id.clone()))
        {
            return Err(self.roll_back(ride_id, driver_id, err));
        }

        // The ride may have been cancelled between the two writes.
        let current = self.rides.get(ride_id)?;
        if current.status == RideStatus::Cancelled {
            if self.drivers.finish_ride(driver_id, ride_id, None)? == FinishOutcome::Released {
                debug!(ride_id = %ride_id, driver_id = %driver_id, "Released driver of ride cancelled mid-accept");
            }
            return Err(DispatchError::AlreadyTerminal {
                ride_id: ride_id.clone(),
                status: current.status,
            });
        }

        info!(ride_id = %ride_id, driver_id = %driver_id, "Ride accepted");
        Ok(accepted)
    }

    fn roll_back(&self, ride_id: &RideId, driver_id: &DriverId, cause: DispatchError) -> DispatchError {
        let rollback = self.rides.compare_and_set_status(
            ride_id,
            RideStatus::Accepted,
            RideStatus::Searching,
            RideMutation::default().clear_driver(),
        );
        let reason = match rollback {
            Ok(_) => {
                warn!(ride_id = %ride_id, driver_id = %driver_id, error = %cause, "Driver binding failed, ride back to searching");
                cause.to_string()
            }
            // Cancelled meanwhile: nothing is bound on either side.
            Err(DispatchError::Conflict { actual, .. }) if actual.is_terminal() => {
                warn!(ride_id = %ride_id, driver_id = %driver_id, error = %cause, ?actual, "Driver binding failed on a ride that is now terminal");
                cause.to_string()
            }
            Err(rollback_err) => {
                warn!(ride_id = %ride_id, driver_id = %driver_id, error = %cause, rollback_error = %rollback_err, "Rollback failed");
                format!("{cause}; rollback failed: {rollback_err}")
            }
        };
        DispatchError::AssignmentFailed {
            ride_id: ride_id.clone(),
            driver_id: driver_id.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::drivers::InMemoryDriverStore;
    use crate::error::ErrorKind;
    use crate::fare::RideType;
    use crate::geo::{Availability, H3GeoIndex, LatLon};
    use crate::ride::NewRideRequest;
    use crate::store::InMemoryRideStore;

    struct Fixture {
        engine: DispatchEngine,
        rides: Arc<InMemoryRideStore>,
        drivers: Arc<InMemoryDriverStore>,
        geo: Arc<H3GeoIndex>,
        pickup: LatLon,
    }

    fn fixture() -> Fixture {
        let rides = Arc::new(InMemoryRideStore::default());
        let drivers = Arc::new(InMemoryDriverStore::default());
        let geo = Arc::new(H3GeoIndex::default());
        let engine = DispatchEngine::new(
            rides.clone(),
            drivers.clone(),
            geo.clone(),
            DispatchConfig::default(),
            Duration::from_secs(45).as_millis() as u64,
        );
        Fixture {
            engine,
            rides,
            drivers,
            geo,
            pickup: LatLon::new(33.6844, 73.0479).expect("valid"),
        }
    }

    impl Fixture {
        fn driver(&self, id: &str, verified: bool, km: f64) -> DriverId {
            let driver_id = DriverId::from(id);
            self.drivers
                .register(&driver_id, verified, 0)
                .expect("register");
            self.geo
                .upsert(&driver_id, self.pickup.offset(90.0, km), Availability::Idle, 0)
                .expect("upsert");
            driver_id
        }

        fn ride(&self, id: &str) -> RideId {
            let request = NewRideRequest::new(
                "rider-1".into(),
                self.pickup,
                self.pickup.offset(0.0, 5.0),
                RideType::Car,
            )
            .with_id(id);
            self.rides.create(request, 0).expect("create")
        }
    }

    #[test]
    fn candidates_skip_unverified_and_bound_drivers() {
        let f = fixture();
        let ride = f.ride("ride-1");
        f.driver("near", true, 1.0);
        f.driver("unverified", false, 0.5);
        let bound = f.driver("bound", true, 0.2);
        f.drivers
            .compare_and_set_ride(&bound, None, Some("other".into()))
            .expect("bind");

        let candidates = f.engine.find_candidates(&ride, None, 1_000).expect("query");
        let ids: Vec<_> = candidates.iter().map(|c| c.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["near"]);
    }

    #[test]
    fn accept_binds_both_sides() {
        let f = fixture();
        let ride = f.ride("ride-1");
        let driver = f.driver("d1", true, 1.0);

        let accepted = f.engine.accept(&ride, &driver, 10).expect("accept");
        assert_eq!(accepted.status, RideStatus::Accepted);
        assert_eq!(accepted.driver_id, Some(driver.clone()));
        assert_eq!(
            f.drivers.get(&driver).expect("get").current_ride,
            Some(ride.clone())
        );
        assert!(f.engine.find_candidates(&ride, None, 10).expect("query").is_empty());
    }

    #[test]
    fn second_accept_is_already_taken() {
        let f = fixture();
        let ride = f.ride("ride-1");
        let first = f.driver("d1", true, 1.0);
        let second = f.driver("d2", true, 3.0);
        f.engine.accept(&ride, &first, 10).expect("accept");

        let err = f.engine.accept(&ride, &second, 11).expect_err("lost");
        assert_eq!(err.kind(), ErrorKind::AlreadyTaken);
        assert!(f.drivers.get(&second).expect("get").is_free());
    }

    #[test]
    fn unverified_driver_cannot_accept() {
        let f = fixture();
        let ride = f.ride("ride-1");
        let driver = f.driver("d1", false, 1.0);
        let err = f.engine.accept(&ride, &driver, 10).expect_err("unverified");
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(f.rides.get(&ride).expect("get").status, RideStatus::Searching);
    }
}
