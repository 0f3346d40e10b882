//! Location telemetry: validates actor position reports, feeds the geo index and
//! keeps a last-known-location record per actor.
//!
//! - Driver reports land in the [`GeoIndex`] with availability derived from the
//!   driver registry (`in_ride` while bound to a ride, `idle` otherwise)
//! - Every report, rider or driver, updates [`LastKnownLocations`]
//! - Geo writes are the only retried operation in the core, and only on `Timeout`
//! - [`LocationTelemetry::expire_stale`] is the safety net behind explicit
//!   [`LocationTelemetry::mark_offline`] calls

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LocationConfig;
use crate::drivers::DriverStore;
use crate::error::DispatchResult;
use crate::geo::{Availability, GeoIndex, LatLon};
use crate::sync::{read_within, write_within};
use crate::types::{Actor, ActorId, DriverId, Role};

/// Latest position reported by a rider or driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastKnownLocation {
    pub actor_id: ActorId,
    pub role: Role,
    pub position: LatLon,
    pub updated_at_ms: u64,
}

/// Per-actor last-known positions. Reports older than the stored one are ignored.
pub struct LastKnownLocations {
    entries: RwLock<HashMap<ActorId, LastKnownLocation>>,
    timeout: Duration,
}

impl LastKnownLocations {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Returns `false` when a newer report was already stored.
    pub fn record(&self, actor: &Actor, position: LatLon, at_ms: u64) -> DispatchResult<bool> {
        let mut entries = write_within(&self.entries, self.timeout, "last-known write")?;
        if let Some(existing) = entries.get(&actor.id) {
            if existing.updated_at_ms > at_ms {
                return Ok(false);
            }
        }
        entries.insert(
            actor.id.clone(),
            LastKnownLocation {
                actor_id: actor.id.clone(),
                role: actor.role,
                position,
                updated_at_ms: at_ms,
            },
        );
        Ok(true)
    }

    pub fn get(&self, actor_id: &ActorId) -> DispatchResult<Option<LastKnownLocation>> {
        let entries = read_within(&self.entries, self.timeout, "last-known read")?;
        Ok(entries.get(actor_id).cloned())
    }
}

/// Outcome of a single accepted location report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationReport {
    pub position: LatLon,
    /// Availability written to the geo index; `None` for riders.
    pub availability: Option<Availability>,
    /// When the actor should report again.
    pub next_report_in: Duration,
}

pub struct LocationTelemetry {
    geo: Arc<dyn GeoIndex>,
    drivers: Arc<dyn DriverStore>,
    last_known: LastKnownLocations,
    config: LocationConfig,
}

impl LocationTelemetry {
    pub fn new(
        geo: Arc<dyn GeoIndex>,
        drivers: Arc<dyn DriverStore>,
        config: LocationConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            geo,
            drivers,
            last_known: LastKnownLocations::new(store_timeout),
            config,
        }
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    pub fn last_known(&self, actor_id: &ActorId) -> DispatchResult<Option<LastKnownLocation>> {
        self.last_known.get(actor_id)
    }

    /// Ingest one position report. Identical or out-of-order repeats are harmless.
    pub fn report(
        &self,
        actor: &Actor,
        lat: f64,
        lon: f64,
        now_ms: u64,
    ) -> DispatchResult<LocationReport> {
        let position = LatLon::new(lat, lon)?;

        let (availability, next_report_in) = match actor.role {
            Role::Driver => {
                let record = self.drivers.get(&actor.id)?;
                let availability = if record.is_free() {
                    Availability::Idle
                } else {
                    Availability::InRide
                };
                self.write_with_retry(&actor.id, position, availability, now_ms)?;
                (Some(availability), self.report_interval(!record.is_free()))
            }
            Role::Rider => (None, self.report_interval(false)),
        };

        if !self.last_known.record(actor, position, now_ms)? {
            debug!(actor_id = %actor.id, "Out-of-order location report ignored");
        }

        Ok(LocationReport {
            position,
            availability,
            next_report_in,
        })
    }

    /// Report cadence: shorter while the driver is on a ride.
    pub fn report_interval(&self, on_ride: bool) -> Duration {
        if on_ride {
            Duration::from_millis(self.config.active_report_interval_ms)
        } else {
            Duration::from_millis(self.config.idle_report_interval_ms)
        }
    }

    /// Exclude a driver from matching immediately. Returns `false` if the driver never
    /// reported a position (there is nothing to exclude).
    pub fn mark_offline(&self, driver_id: &DriverId) -> DispatchResult<bool> {
        let known = self.geo.set_availability(driver_id, Availability::Offline)?;
        if known {
            info!(driver_id = %driver_id, "Driver marked offline");
        }
        Ok(known)
    }

    /// Move a driver's geo availability from `from` to `to` after its ride binding
    /// changed. A driver in any other state (notably `offline`) is left alone until
    /// its next report. Best effort: the registry binding is authoritative.
    pub fn sync_availability(&self, driver_id: &DriverId, from: Availability, to: Availability) {
        match self.geo.set_availability_if(driver_id, from, to) {
            Ok(true) => {}
            Ok(false) => {
                debug!(driver_id = %driver_id, ?from, ?to, "Geo availability left unchanged")
            }
            Err(err) => {
                warn!(driver_id = %driver_id, ?to, error = %err, "Geo availability update failed")
            }
        }
    }

    /// Mark every driver silent for longer than the staleness window as offline.
    pub fn expire_stale(&self, now_ms: u64) -> DispatchResult<usize> {
        let stale = self.geo.stale_drivers(now_ms, self.config.staleness_ms)?;
        let mut expired = 0;
        for driver_id in &stale {
            if self.geo.set_availability(driver_id, Availability::Offline)? {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "Expired stale driver locations");
        }
        Ok(expired)
    }

    fn write_with_retry(
        &self,
        driver_id: &DriverId,
        position: LatLon,
        availability: Availability,
        now_ms: u64,
    ) -> DispatchResult<()> {
        let attempts = self.config.geo_write_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.geo.upsert(driver_id, position, availability, now_ms) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < attempts => {
                    debug!(driver_id = %driver_id, attempt, error = %err, "Retrying geo write");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
