//! Service configuration: dispatch radius, staleness window, fares, proximity
//! gating and store deadlines. Every field has a default, so a partial JSON
//! document only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fare::FareConfig;

/// Default candidate search radius (km).
const DEFAULT_CANDIDATE_RADIUS_KM: f64 = 6.0;

/// Drivers report every 15 s, every 10 s during a ride; three missed idle reports
/// make a position stale.
const DEFAULT_IDLE_REPORT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_ACTIVE_REPORT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_STALENESS_MS: u64 = 45_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub candidate_radius_km: f64,
    /// Upper bound on candidates surfaced per request.
    pub max_candidates: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            candidate_radius_km: DEFAULT_CANDIDATE_RADIUS_KM,
            max_candidates: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Reports older than this are excluded from matching.
    pub staleness_ms: u64,
    pub idle_report_interval_ms: u64,
    pub active_report_interval_ms: u64,
    /// Attempts for a geo index write before the report fails.
    pub geo_write_attempts: u32,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            staleness_ms: DEFAULT_STALENESS_MS,
            idle_report_interval_ms: DEFAULT_IDLE_REPORT_INTERVAL_MS,
            active_report_interval_ms: DEFAULT_ACTIVE_REPORT_INTERVAL_MS,
            geo_write_attempts: 3,
        }
    }
}

/// Whether `arrived`/`start` require the driver to be near the pickup point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProximityPolicy {
    /// Distance is checked and logged but never blocks a transition.
    #[default]
    Advisory,
    /// Transitions fail with `NotAtPickup` beyond the threshold.
    Enforced,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub policy: ProximityPolicy,
    pub threshold_m: f64,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            policy: ProximityPolicy::Advisory,
            threshold_m: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deadline for any single store operation.
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 2_000,
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub dispatch: DispatchConfig,
    pub location: LocationConfig,
    pub fare: FareConfig,
    pub proximity: ProximityConfig,
    pub store: StoreConfig,
}

impl ServiceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let radius = self.dispatch.candidate_radius_km;
        if !(radius.is_finite() && radius > 0.0) {
            return Err(ConfigError::Invalid(
                "dispatch.candidate_radius_km must be positive".to_string(),
            ));
        }
        if self.dispatch.max_candidates == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_candidates must be at least 1".to_string(),
            ));
        }
        if self.location.staleness_ms == 0 {
            return Err(ConfigError::Invalid(
                "location.staleness_ms must be positive".to_string(),
            ));
        }
        if self.location.geo_write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "location.geo_write_attempts must be at least 1".to_string(),
            ));
        }
        let threshold = self.proximity.threshold_m;
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(ConfigError::Invalid(
                "proximity.threshold_m must be positive".to_string(),
            ));
        }
        if self.store.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store.operation_timeout_ms must be positive".to_string(),
            ));
        }
        self.fare.validate()
    }

    pub fn with_candidate_radius_km(mut self, radius_km: f64) -> Self {
        self.dispatch.candidate_radius_km = radius_km;
        self
    }

    pub fn with_staleness_secs(mut self, secs: u64) -> Self {
        self.location.staleness_ms = secs * 1000;
        self
    }

    pub fn with_fare(mut self, fare: FareConfig) -> Self {
        self.fare = fare;
        self
    }

    pub fn with_proximity_policy(mut self, policy: ProximityPolicy) -> Self {
        self.proximity.policy = policy;
        self
    }

    pub fn with_store_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.store.operation_timeout_ms = timeout_ms;
        self
    }
}
