//! Ride state machine: driver-driven phase transitions, cancellation and the
//! driver release that follows a terminal state.
//!
//! Every transition is a compare-and-set against the status the caller expects,
//! so a stale or replayed request observes `Conflict` and never corrupts state.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ProximityConfig, ProximityPolicy};
use crate::drivers::{DriverStore, FinishOutcome};
use crate::error::{DispatchError, DispatchResult};
use crate::fare::FareCalculator;
use crate::geo::{Availability, GeoIndex};
use crate::ride::{RideMutation, RideRequest, RideStatus};
use crate::store::RideRequestStore;
use crate::types::{Actor, DriverId, RideId, Role};

/// Cancellation retries when the ride moves between read and write.
const CANCEL_ATTEMPTS: usize = 8;

/// What [`RideStateMachine::reconcile_driver`] found and did.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Driver was not bound to any ride.
    Free,
    /// Bound ride is still active; the binding is legitimate.
    Active(RideId),
    /// Binding to a terminal ride was released, crediting `earnings` if it completed.
    Released { ride_id: RideId, earnings: Option<f64> },
}

pub struct RideStateMachine {
    rides: Arc<dyn RideRequestStore>,
    drivers: Arc<dyn DriverStore>,
    geo: Arc<dyn GeoIndex>,
    fares: FareCalculator,
    proximity: ProximityConfig,
    staleness_ms: u64,
}

impl RideStateMachine {
    pub fn new(
        rides: Arc<dyn RideRequestStore>,
        drivers: Arc<dyn DriverStore>,
        geo: Arc<dyn GeoIndex>,
        fares: FareCalculator,
        proximity: ProximityConfig,
        staleness_ms: u64,
    ) -> Self {
        Self {
            rides,
            drivers,
            geo,
            fares,
            proximity,
            staleness_ms,
        }
    }

    pub fn mark_arrived(
        &self,
        actor: &Actor,
        ride_id: &RideId,
        now_ms: u64,
    ) -> DispatchResult<RideRequest> {
        self.advance(actor, ride_id, RideStatus::Accepted, "mark arrived", now_ms)
    }

    pub fn start_ride(
        &self,
        actor: &Actor,
        ride_id: &RideId,
        now_ms: u64,
    ) -> DispatchResult<RideRequest> {
        self.advance(actor, ride_id, RideStatus::Arrived, "start ride", now_ms)
    }

    /// Complete the ride, persisting the fare and crediting the driver.
    ///
    /// If the driver release fails after the ride is persisted as completed the
    /// ride is still returned; [`Self::reconcile_driver`] repairs the binding.
    pub fn complete_ride(
        &self,
        actor: &Actor,
        ride_id: &RideId,
        now_ms: u64,
    ) -> DispatchResult<RideRequest> {
        let ride = self.rides.get(ride_id)?;
        let driver_id = authorize_driver(actor, &ride, "complete ride")?;
        check_status(&ride, RideStatus::InProgress)?;

        let quote = self.fares.quote(ride.ride_type, ride.trip_distance_km())?;
        let completed = self.rides.compare_and_set_status(
            ride_id,
            RideStatus::InProgress,
            RideStatus::Completed,
            RideMutation::at(now_ms).with_fare(quote.total),
        )?;
        info!(ride_id = %ride_id, driver_id = %driver_id, fare = quote.total, "Ride completed");

        self.release_driver(&driver_id, ride_id, Some(quote.total));
        Ok(completed)
    }

    /// Cancel from any non-terminal state. The rider who requested the ride or the
    /// bound driver may cancel; the binding, if any, is released.
    pub fn cancel_ride(
        &self,
        actor: &Actor,
        ride_id: &RideId,
        now_ms: u64,
    ) -> DispatchResult<RideRequest> {
        let mut ride = self.rides.get(ride_id)?;
        authorize_canceller(actor, &ride)?;

        for _ in 0..CANCEL_ATTEMPTS {
            if ride.status.is_terminal() {
                return Err(DispatchError::AlreadyTerminal {
                    ride_id: ride_id.clone(),
                    status: ride.status,
                });
            }
            match self.rides.compare_and_set_status(
                ride_id,
                ride.status,
                RideStatus::Cancelled,
                RideMutation::at(now_ms).cancelled_by(actor.id.clone()),
            ) {
                Ok(cancelled) => {
                    info!(ride_id = %ride_id, actor_id = %actor.id, from = ?ride.status, "Ride cancelled");
                    if let Some(driver_id) = &cancelled.driver_id {
                        self.release_driver(driver_id, ride_id, None);
                    }
                    return Ok(cancelled);
                }
                Err(DispatchError::Conflict { actual, .. }) => {
                    debug!(ride_id = %ride_id, ?actual, "Ride moved during cancel, retrying");
                    ride = self.rides.get(ride_id)?;
                }
                Err(err) => return Err(err),
            }
        }
        Err(DispatchError::Conflict {
            ride_id: ride_id.clone(),
            expected: ride.status,
            actual: self.rides.get(ride_id)?.status,
        })
    }

    /// Release a driver left bound to a ride that is already terminal.
    pub fn reconcile_driver(&self, driver_id: &DriverId) -> DispatchResult<Reconciliation> {
        let record = self.drivers.get(driver_id)?;
        let Some(ride_id) = record.current_ride else {
            return Ok(Reconciliation::Free);
        };
        let ride = self.rides.get(&ride_id)?;
        if !ride.status.is_terminal() {
            return Ok(Reconciliation::Active(ride_id));
        }
        let earnings = match ride.status {
            RideStatus::Completed => ride.fare,
            _ => None,
        };
        match self.drivers.finish_ride(driver_id, &ride_id, earnings)? {
            FinishOutcome::Released => {
                info!(driver_id = %driver_id, ride_id = %ride_id, ?earnings, "Reconciled stale driver binding");
                self.set_idle(driver_id);
                Ok(Reconciliation::Released { ride_id, earnings })
            }
            // Someone else released it between the read and the write.
            FinishOutcome::NotBound => Ok(Reconciliation::Free),
        }
    }

    fn advance(
        &self,
        actor: &Actor,
        ride_id: &RideId,
        expected: RideStatus,
        action: &'static str,
        now_ms: u64,
    ) -> DispatchResult<RideRequest> {
        let ride = self.rides.get(ride_id)?;
        let driver_id = authorize_driver(actor, &ride, action)?;
        check_status(&ride, expected)?;
        self.check_proximity(&driver_id, &ride, now_ms)?;

        let to = expected.next().ok_or(DispatchError::AlreadyTerminal {
            ride_id: ride_id.clone(),
            status: expected,
        })?;
        let updated =
            self.rides
                .compare_and_set_status(ride_id, expected, to, RideMutation::at(now_ms))?;
        info!(ride_id = %ride_id, driver_id = %driver_id, status = ?to, "Ride advanced");
        Ok(updated)
    }

    fn check_proximity(
        &self,
        driver_id: &DriverId,
        ride: &RideRequest,
        now_ms: u64,
    ) -> DispatchResult<()> {
        let enforced = self.proximity.policy == ProximityPolicy::Enforced;
        let location = self
            .geo
            .get(driver_id)?
            .filter(|location| !location.is_stale(now_ms, self.staleness_ms));
        let Some(location) = location else {
            if enforced {
                return Err(DispatchError::PositionUnknown(driver_id.clone()));
            }
            warn!(ride_id = %ride.id, driver_id = %driver_id, "No fresh driver position for pickup check");
            return Ok(());
        };

        let distance_m = location.position.distance_km(&ride.pickup) * 1000.0;
        if distance_m <= self.proximity.threshold_m {
            return Ok(());
        }
        if enforced {
            return Err(DispatchError::NotAtPickup {
                distance_m,
                threshold_m: self.proximity.threshold_m,
            });
        }
        warn!(ride_id = %ride.id, driver_id = %driver_id, distance_m, "Driver is away from pickup");
        Ok(())
    }

    fn release_driver(&self, driver_id: &DriverId, ride_id: &RideId, earnings: Option<f64>) {
        match self.drivers.finish_ride(driver_id, ride_id, earnings) {
            Ok(FinishOutcome::Released) => self.set_idle(driver_id),
            // Binding not written yet: the accepting call releases it.
            Ok(FinishOutcome::NotBound) => {
                debug!(driver_id = %driver_id, ride_id = %ride_id, "Driver not bound at release")
            }
            Err(err) => {
                warn!(driver_id = %driver_id, ride_id = %ride_id, error = %err, "Driver release failed, needs reconciliation")
            }
        }
    }

    /// Back to `idle` only from `in_ride`: a driver who went offline stays offline.
    fn set_idle(&self, driver_id: &DriverId) {
        match self
            .geo
            .set_availability_if(driver_id, Availability::InRide, Availability::Idle)
        {
            Ok(true) => {}
            Ok(false) => debug!(driver_id = %driver_id, "Driver not in ride in geo index, left as is"),
            Err(err) => warn!(driver_id = %driver_id, error = %err, "Geo availability update failed"),
        }
    }
}

fn check_status(ride: &RideRequest, expected: RideStatus) -> DispatchResult<()> {
    if ride.status == expected {
        Ok(())
    } else {
        Err(DispatchError::Conflict {
            ride_id: ride.id.clone(),
            expected,
            actual: ride.status,
        })
    }
}

/// The acting driver must be the one bound to the ride.
fn authorize_driver(
    actor: &Actor,
    ride: &RideRequest,
    action: &'static str,
) -> DispatchResult<DriverId> {
    if actor.role != Role::Driver || !ride.is_bound_to(&actor.id) {
        return Err(DispatchError::Forbidden {
            actor_id: actor.id.clone(),
            action,
        });
    }
    Ok(actor.id.clone())
}

fn authorize_canceller(actor: &Actor, ride: &RideRequest) -> DispatchResult<()> {
    let allowed = match actor.role {
        Role::Rider => ride.rider_id == actor.id,
        Role::Driver => ride.is_bound_to(&actor.id),
    };
    if allowed {
        Ok(())
    } else {
        Err(DispatchError::Forbidden {
            actor_id: actor.id.clone(),
            action: "cancel ride",
        })
    }
}
