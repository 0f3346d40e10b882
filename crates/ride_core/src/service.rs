//! `RideService`: the entry point that wires stores, dispatch, lifecycle and
//! telemetry together behind operations taking an explicit [`Actor`].
//!
//! The service owns the cross-cutting work: reading the clock, publishing
//! [`RideEvent`]s after successful writes and updating [`DispatchStats`].

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::dispatch::{Candidate, DispatchEngine};
use crate::drivers::{DriverRecord, DriverStore, InMemoryDriverStore};
use crate::error::{ConfigError, DispatchError, DispatchResult, ErrorKind};
use crate::events::{EventBus, RideEvent};
use crate::fare::{FareCalculator, FareQuote, RideType};
use crate::geo::{Availability, DriverLocation, GeoIndex, H3GeoIndex, LatLon};
use crate::lifecycle::{Reconciliation, RideStateMachine};
use crate::location::{LastKnownLocation, LocationReport, LocationTelemetry};
use crate::ride::{NewRideRequest, RideRequest};
use crate::stats::{DispatchStats, StatsSnapshot};
use crate::store::{InMemoryRideStore, RideListing, RideRequestStore};
use crate::types::{Actor, ActorId, DriverId, RideId, RiderId, Role};

pub struct RideService {
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    rides: Arc<dyn RideRequestStore>,
    drivers: Arc<dyn DriverStore>,
    geo: Arc<dyn GeoIndex>,
    fares: FareCalculator,
    dispatch: DispatchEngine,
    lifecycle: RideStateMachine,
    telemetry: LocationTelemetry,
    events: EventBus,
    stats: DispatchStats,
}

impl RideService {
    /// Service over in-memory stores and the system clock.
    pub fn in_memory(config: ServiceConfig) -> Result<Self, ConfigError> {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let timeout = config.store.operation_timeout();
        Self::with_stores(
            config,
            clock,
            Arc::new(InMemoryRideStore::new(timeout)),
            Arc::new(InMemoryDriverStore::new(timeout)),
            Arc::new(H3GeoIndex::new(h3o::Resolution::Seven, timeout)),
        )
    }

    pub fn with_stores(
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
        rides: Arc<dyn RideRequestStore>,
        drivers: Arc<dyn DriverStore>,
        geo: Arc<dyn GeoIndex>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let fares = FareCalculator::new(config.fare);
        let staleness_ms = config.location.staleness_ms;
        Ok(Self {
            dispatch: DispatchEngine::new(
                rides.clone(),
                drivers.clone(),
                geo.clone(),
                config.dispatch,
                staleness_ms,
            ),
            lifecycle: RideStateMachine::new(
                rides.clone(),
                drivers.clone(),
                geo.clone(),
                fares,
                config.proximity,
                staleness_ms,
            ),
            telemetry: LocationTelemetry::new(
                geo.clone(),
                drivers.clone(),
                config.location,
                config.store.operation_timeout(),
            ),
            config,
            clock,
            rides,
            drivers,
            geo,
            fares,
            events: EventBus::new(),
            stats: DispatchStats::default(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[instrument(skip(self, actor, request), fields(actor_id = %actor.id))]
    pub fn request_ride(
        &self,
        actor: &Actor,
        request: NewRideRequest,
    ) -> DispatchResult<RideRequest> {
        if actor.role != Role::Rider || request.rider_id != actor.id {
            return Err(DispatchError::Forbidden {
                actor_id: actor.id.clone(),
                action: "request ride",
            });
        }
        let now_ms = self.clock.now_ms();
        let ride_id = self.rides.create(request, now_ms)?;
        let ride = self.rides.get(&ride_id)?;
        self.stats.record_request();
        info!(ride_id = %ride.id, ride_type = ?ride.ride_type, "Ride requested");
        self.publish(&ride, now_ms);
        Ok(ride)
    }

    pub fn ride(&self, ride_id: &RideId) -> DispatchResult<RideRequest> {
        self.rides.get(ride_id)
    }

    /// Candidates within `radius_km` (configured default when `None`).
    #[instrument(skip(self))]
    pub fn find_candidates(
        &self,
        ride_id: &RideId,
        radius_km: Option<f64>,
    ) -> DispatchResult<Vec<Candidate>> {
        self.dispatch
            .find_candidates(ride_id, radius_km, self.clock.now_ms())
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub fn accept_ride(&self, actor: &Actor, ride_id: &RideId) -> DispatchResult<RideRequest> {
        if !actor.is_driver() {
            return Err(DispatchError::Forbidden {
                actor_id: actor.id.clone(),
                action: "accept ride",
            });
        }
        let now_ms = self.clock.now_ms();
        match self.dispatch.accept(ride_id, &actor.id, now_ms) {
            Ok(ride) => {
                self.stats.record_accept_won();
                self.telemetry.sync_availability(
                    &actor.id,
                    Availability::Idle,
                    Availability::InRide,
                );
                self.publish(&ride, now_ms);
                Ok(ride)
            }
            Err(err) => {
                match err.kind() {
                    ErrorKind::AlreadyTaken | ErrorKind::AlreadyTerminal => {
                        self.stats.record_accept_lost()
                    }
                    ErrorKind::AssignmentFailed => self.stats.record_rollback(),
                    _ => {}
                }
                Err(err)
            }
        }
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub fn mark_arrived(&self, actor: &Actor, ride_id: &RideId) -> DispatchResult<RideRequest> {
        let now_ms = self.clock.now_ms();
        let ride = self.lifecycle.mark_arrived(actor, ride_id, now_ms)?;
        self.publish(&ride, now_ms);
        Ok(ride)
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub fn start_ride(&self, actor: &Actor, ride_id: &RideId) -> DispatchResult<RideRequest> {
        let now_ms = self.clock.now_ms();
        let ride = self.lifecycle.start_ride(actor, ride_id, now_ms)?;
        self.publish(&ride, now_ms);
        Ok(ride)
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub fn complete_ride(&self, actor: &Actor, ride_id: &RideId) -> DispatchResult<RideRequest> {
        let now_ms = self.clock.now_ms();
        let ride = self.lifecycle.complete_ride(actor, ride_id, now_ms)?;
        self.stats.record_completion(ride.fare.unwrap_or_default());
        self.publish(&ride, now_ms);
        Ok(ride)
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub fn cancel_ride(&self, actor: &Actor, ride_id: &RideId) -> DispatchResult<RideRequest> {
        let now_ms = self.clock.now_ms();
        let ride = self.lifecycle.cancel_ride(actor, ride_id, now_ms)?;
        self.stats.record_cancellation();
        self.publish(&ride, now_ms);
        Ok(ride)
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub fn report_location(
        &self,
        actor: &Actor,
        lat: f64,
        lon: f64,
    ) -> DispatchResult<LocationReport> {
        let report = self.telemetry.report(actor, lat, lon, self.clock.now_ms())?;
        self.stats.record_location();
        Ok(report)
    }

    /// Explicit disconnect: the driver stops being a candidate right away and stays
    /// offline until its next location report.
    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub fn mark_offline(&self, actor: &Actor) -> DispatchResult<bool> {
        if !actor.is_driver() {
            return Err(DispatchError::Forbidden {
                actor_id: actor.id.clone(),
                action: "go offline",
            });
        }
        self.telemetry.mark_offline(&actor.id)
    }

    pub fn expire_stale(&self) -> DispatchResult<usize> {
        let expired = self.telemetry.expire_stale(self.clock.now_ms())?;
        self.stats.record_expired(expired as u64);
        Ok(expired)
    }

    pub fn last_known_location(
        &self,
        actor_id: &ActorId,
    ) -> DispatchResult<Option<LastKnownLocation>> {
        self.telemetry.last_known(actor_id)
    }

    pub fn driver_location(&self, driver_id: &DriverId) -> DispatchResult<Option<DriverLocation>> {
        self.geo.get(driver_id)
    }

    /// Newest first; pages are fetched lazily and the listing can be restarted.
    pub fn rides_for_rider(&self, rider_id: RiderId) -> RideListing<'_> {
        RideListing::by_rider(self.rides.as_ref(), rider_id)
    }

    pub fn rides_for_driver(&self, driver_id: DriverId) -> RideListing<'_> {
        RideListing::by_driver(self.rides.as_ref(), driver_id)
    }

    #[instrument(skip(self))]
    pub fn register_driver(
        &self,
        driver_id: &DriverId,
        verified: bool,
    ) -> DispatchResult<DriverRecord> {
        let record = self
            .drivers
            .register(driver_id, verified, self.clock.now_ms())?;
        info!("Driver registered");
        Ok(record)
    }

    #[instrument(skip(self))]
    pub fn set_driver_verified(
        &self,
        driver_id: &DriverId,
        verified: bool,
    ) -> DispatchResult<DriverRecord> {
        self.drivers.set_verified(driver_id, verified)
    }

    pub fn driver(&self, driver_id: &DriverId) -> DispatchResult<DriverRecord> {
        self.drivers.get(driver_id)
    }

    #[instrument(skip(self))]
    pub fn reconcile_driver(&self, driver_id: &DriverId) -> DispatchResult<Reconciliation> {
        self.lifecycle.reconcile_driver(driver_id)
    }

    pub fn quote(&self, ride_type: RideType, distance_km: f64) -> DispatchResult<FareQuote> {
        self.fares.quote(ride_type, distance_km)
    }

    /// Quote for the great-circle trip between two points.
    pub fn quote_trip(
        &self,
        ride_type: RideType,
        pickup: LatLon,
        destination: LatLon,
    ) -> DispatchResult<FareQuote> {
        pickup.validate()?;
        destination.validate()?;
        self.fares.quote(ride_type, pickup.distance_km(&destination))
    }

    pub fn subscribe(&self) -> Receiver<RideEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn publish(&self, ride: &RideRequest, at_ms: u64) {
        self.events.publish(RideEvent::from_ride(ride, at_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let err = RideService::in_memory(ServiceConfig::default().with_candidate_radius_km(0.0))
            .err()
            .expect("zero radius");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut no_candidates = ServiceConfig::default();
        no_candidates.dispatch.max_candidates = 0;
        assert!(RideService::in_memory(no_candidates).is_err());

        let err = RideService::in_memory(ServiceConfig::default().with_store_timeout_ms(0))
            .err()
            .expect("zero timeout");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn builder_overrides_reach_the_service() {
        let config = ServiceConfig::default()
            .with_candidate_radius_km(2.5)
            .with_store_timeout_ms(500);
        let service = RideService::in_memory_with_clock(config, Arc::new(ManualClock::new(0)))
            .expect("valid config");
        assert_eq!(service.config().dispatch.candidate_radius_km, 2.5);
        assert_eq!(service.config().store.operation_timeout_ms, 500);
    }

    #[test]
    fn trip_quote_matches_distance_quote() {
        let service = RideService::in_memory(ServiceConfig::default()).expect("service");
        let pickup = LatLon::new(33.6844, 73.0479).expect("valid");
        let destination = pickup.offset(0.0, 5.0);

        let trip = service
            .quote_trip(RideType::Car, pickup, destination)
            .expect("quote");
        assert!((trip.total - 8.5).abs() < 1e-9);
        assert_eq!(trip.display_total, 9.0);
        assert_eq!(
            service.quote(RideType::Car, trip.distance_km).expect("quote"),
            trip
        );

        let off_map = LatLon {
            lat: 91.0,
            lon: 0.0,
        };
        let err = service
            .quote_trip(RideType::Car, pickup, off_map)
            .expect_err("invalid destination");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
