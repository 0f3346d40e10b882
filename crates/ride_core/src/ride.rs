//! Ride request model and the status graph it moves through.

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::fare::RideType;
use crate::geo::{haversine_km, LatLon};
use crate::types::{ActorId, DriverId, RideId, RiderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Searching,
    Accepted,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Forward edge of the lifecycle, if any.
    pub fn next(self) -> Option<RideStatus> {
        match self {
            RideStatus::Searching => Some(RideStatus::Accepted),
            RideStatus::Accepted => Some(RideStatus::Arrived),
            RideStatus::Arrived => Some(RideStatus::InProgress),
            RideStatus::InProgress => Some(RideStatus::Completed),
            RideStatus::Completed | RideStatus::Cancelled => None,
        }
    }

    /// Directed edges of the ride lifecycle. `Accepted -> Searching` is not an
    /// edge here: it exists only as the dispatch rollback.
    pub fn can_transition_to(self, to: RideStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == RideStatus::Cancelled || self.next() == Some(to)
    }

    /// Whether a driver is bound while the ride is in this state.
    pub fn has_driver(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted
                | RideStatus::Arrived
                | RideStatus::InProgress
                | RideStatus::Completed
        )
    }
}

/// A rider's solicitation as submitted, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRideRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<RideId>,
    pub rider_id: RiderId,
    pub pickup: Option<LatLon>,
    pub destination: Option<LatLon>,
    pub ride_type: RideType,
}

impl NewRideRequest {
    pub fn new(
        rider_id: RiderId,
        pickup: LatLon,
        destination: LatLon,
        ride_type: RideType,
    ) -> Self {
        Self {
            id: None,
            rider_id,
            pickup: Some(pickup),
            destination: Some(destination),
            ride_type,
        }
    }

    pub fn with_id(mut self, id: impl Into<RideId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Validate and materialize into a `searching` request.
    pub fn into_request(self, created_at_ms: u64) -> DispatchResult<RideRequest> {
        let pickup = checked_location(self.pickup, "pickup")?;
        let destination = checked_location(self.destination, "destination")?;
        Ok(RideRequest {
            id: self.id.unwrap_or_else(RideId::generate),
            rider_id: self.rider_id,
            pickup,
            destination,
            ride_type: self.ride_type,
            status: RideStatus::Searching,
            driver_id: None,
            created_at_ms,
            distance_km: Some(haversine_km(pickup, destination)),
            fare: None,
            accepted_at_ms: None,
            arrived_at_ms: None,
            started_at_ms: None,
            completed_at_ms: None,
            cancelled_at_ms: None,
            cancelled_by: None,
            version: 0,
        })
    }
}

fn checked_location(location: Option<LatLon>, field: &'static str) -> DispatchResult<LatLon> {
    let location = location.ok_or(DispatchError::InvalidLocation { field })?;
    if location.lat.is_nan() || location.lon.is_nan() {
        return Err(DispatchError::InvalidLocation { field });
    }
    location.validate()?;
    Ok(location)
}

/// Persisted ride request. Never deleted; terminal rides stay as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: RideId,
    pub rider_id: RiderId,
    pub pickup: LatLon,
    pub destination: LatLon,
    pub ride_type: RideType,
    pub status: RideStatus,
    pub driver_id: Option<DriverId>,
    pub created_at_ms: u64,
    /// Great-circle pickup to destination distance.
    pub distance_km: Option<f64>,
    /// Full-precision fare, set on completion.
    pub fare: Option<f64>,
    pub accepted_at_ms: Option<u64>,
    pub arrived_at_ms: Option<u64>,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub cancelled_at_ms: Option<u64>,
    pub cancelled_by: Option<ActorId>,
    /// Incremented on every successful write.
    pub version: u64,
}

impl RideRequest {
    pub fn trip_distance_km(&self) -> f64 {
        self.distance_km
            .unwrap_or_else(|| haversine_km(self.pickup, self.destination))
    }

    pub fn is_bound_to(&self, driver_id: &DriverId) -> bool {
        self.driver_id.as_ref() == Some(driver_id)
    }
}

/// How a compare-and-set write touches the driver binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DriverUpdate {
    #[default]
    Keep,
    Assign(DriverId),
    /// Only valid when returning to `searching` (dispatch rollback).
    Clear,
}

/// Field changes applied together with a status compare-and-set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RideMutation {
    pub driver: DriverUpdate,
    pub fare: Option<f64>,
    pub cancelled_by: Option<ActorId>,
    /// Timestamp recorded for the new status.
    pub at_ms: Option<u64>,
}

impl RideMutation {
    pub fn at(at_ms: u64) -> Self {
        Self {
            at_ms: Some(at_ms),
            ..Self::default()
        }
    }

    pub fn assign_driver(mut self, driver_id: DriverId) -> Self {
        self.driver = DriverUpdate::Assign(driver_id);
        self
    }

    pub fn clear_driver(mut self) -> Self {
        self.driver = DriverUpdate::Clear;
        self
    }

    pub fn with_fare(mut self, fare: f64) -> Self {
        self.fare = Some(fare);
        self
    }

    pub fn cancelled_by(mut self, actor_id: ActorId) -> Self {
        self.cancelled_by = Some(actor_id);
        self
    }

    /// Produce the next version of `ride`, or an error if the mutation would break
    /// the driver-binding invariants. `ride` itself is left untouched.
    pub fn apply(&self, ride: &RideRequest, new_status: RideStatus) -> DispatchResult<RideRequest> {
        let mut next = ride.clone();
        match &self.driver {
            DriverUpdate::Keep => {}
            DriverUpdate::Assign(driver_id) => match &ride.driver_id {
                Some(existing) if existing != driver_id => {
                    return Err(DispatchError::InvalidInput(format!(
                        "ride {} is already bound to driver {existing}",
                        ride.id
                    )));
                }
                _ => next.driver_id = Some(driver_id.clone()),
            },
            DriverUpdate::Clear => {
                if new_status != RideStatus::Searching {
                    return Err(DispatchError::InvalidInput(format!(
                        "driver of ride {} can only be cleared when returning to searching",
                        ride.id
                    )));
                }
                next.driver_id = None;
                next.accepted_at_ms = None;
            }
        }
        if let Some(fare) = self.fare {
            next.fare = Some(fare);
        }
        if let Some(actor_id) = &self.cancelled_by {
            next.cancelled_by = Some(actor_id.clone());
        }
        match new_status {
            RideStatus::Searching => {}
            RideStatus::Accepted => next.accepted_at_ms = self.at_ms.or(next.accepted_at_ms),
            RideStatus::Arrived => next.arrived_at_ms = self.at_ms,
            RideStatus::InProgress => next.started_at_ms = self.at_ms,
            RideStatus::Completed => next.completed_at_ms = self.at_ms,
            RideStatus::Cancelled => next.cancelled_at_ms = self.at_ms,
        }
        if new_status.has_driver() && next.driver_id.is_none() {
            return Err(DispatchError::InvalidInput(format!(
                "ride {} cannot become {new_status:?} without a driver",
                ride.id
            )));
        }
        next.status = new_status;
        next.version = ride.version + 1;
        Ok(next)
    }
}
