pub mod clock;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod events;
pub mod fare;
pub mod geo;
pub mod lifecycle;
pub mod location;
pub mod record;
pub mod ride;
pub mod service;
pub mod stats;
pub mod store;
mod sync;
pub mod types;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub use error::{ConfigError, DispatchError, DispatchResult, ErrorKind};
pub use service::RideService;
pub use types::{Actor, ActorId, DriverId, RideId, RiderId, Role};
