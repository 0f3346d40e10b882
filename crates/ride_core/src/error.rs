//! Error taxonomy shared by every dispatch operation.

use crate::ride::RideStatus;
use crate::types::{ActorId, DriverId, RideId};

/// Coarse classification a client branches on (e.g. re-query candidates on
/// `AlreadyTaken`, show a connectivity error on `Timeout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    Conflict,
    AlreadyTaken,
    AlreadyTerminal,
    NotFound,
    Timeout,
    AssignmentFailed,
    Forbidden,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("coordinate out of range: lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
    #[error("{field} location is missing or not a number")]
    InvalidLocation { field: &'static str },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("ride {0} already exists")]
    DuplicateId(RideId),
    #[error("ride {ride_id} is {actual:?}, expected {expected:?}")]
    Conflict {
        ride_id: RideId,
        expected: RideStatus,
        actual: RideStatus,
    },
    #[error("driver {driver_id} is bound to another ride")]
    DriverBusy { driver_id: DriverId },
    #[error("driver is {distance_m:.0} m from pickup, limit is {threshold_m:.0} m")]
    NotAtPickup { distance_m: f64, threshold_m: f64 },
    #[error("no fresh position for driver {0}")]
    PositionUnknown(DriverId),
    #[error("ride {0} was taken by another driver")]
    AlreadyTaken(RideId),
    #[error("ride {ride_id} is already {status:?}")]
    AlreadyTerminal { ride_id: RideId, status: RideStatus },
    #[error("ride {0} not found")]
    RideNotFound(RideId),
    #[error("driver {0} not found")]
    DriverNotFound(DriverId),
    #[error("driver {0} already registered")]
    DriverExists(DriverId),
    #[error("{operation} did not complete within {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("assignment of driver {driver_id} to ride {ride_id} rolled back: {reason}")]
    AssignmentFailed {
        ride_id: RideId,
        driver_id: DriverId,
        reason: String,
    },
    #[error("actor {actor_id} may not {action}")]
    Forbidden {
        actor_id: ActorId,
        action: &'static str,
    },
    #[error("driver {0} is not verified")]
    DriverNotVerified(DriverId),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::InvalidCoordinate { .. }
            | DispatchError::InvalidLocation { .. }
            | DispatchError::InvalidInput(_) => ErrorKind::InvalidInput,
            DispatchError::DuplicateId(_)
            | DispatchError::DriverExists(_)
            | DispatchError::Conflict { .. }
            | DispatchError::DriverBusy { .. }
            | DispatchError::NotAtPickup { .. }
            | DispatchError::PositionUnknown(_) => ErrorKind::Conflict,
            DispatchError::AlreadyTaken(_) => ErrorKind::AlreadyTaken,
            DispatchError::AlreadyTerminal { .. } => ErrorKind::AlreadyTerminal,
            DispatchError::RideNotFound(_) | DispatchError::DriverNotFound(_) => {
                ErrorKind::NotFound
            }
            DispatchError::Timeout { .. } => ErrorKind::Timeout,
            DispatchError::AssignmentFailed { .. } => ErrorKind::AssignmentFailed,
            DispatchError::Forbidden { .. } | DispatchError::DriverNotVerified(_) => {
                ErrorKind::Forbidden
            }
        }
    }

    /// Whether a network-style write may be retried transparently.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised while loading or validating [`crate::config::ServiceConfig`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
