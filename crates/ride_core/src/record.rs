//! Flat key-value records for the external persistence layer.
//!
//! Nested coordinates are spread into `<field>_lat` / `<field>_lon` keys and absent
//! optional fields are omitted, so every record is a single-level JSON object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DispatchError, DispatchResult};
use crate::fare::RideType;
use crate::geo::{Availability, DriverLocation, LatLon};
use crate::ride::{RideRequest, RideStatus};
use crate::types::{ActorId, DriverId, RideId, RiderId};

#[derive(Debug, Serialize, Deserialize)]
struct RideRecord {
    id: RideId,
    rider_id: RiderId,
    pickup_lat: Option<f64>,
    pickup_lon: Option<f64>,
    destination_lat: Option<f64>,
    destination_lon: Option<f64>,
    ride_type: RideType,
    status: RideStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    driver_id: Option<DriverId>,
    created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fare: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    accepted_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arrived_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cancelled_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cancelled_by: Option<ActorId>,
    #[serde(default)]
    version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DriverLocationRecord {
    driver_id: DriverId,
    lat: f64,
    lon: f64,
    updated_at_ms: u64,
    availability: Availability,
}

fn to_value<T: Serialize>(record: &T) -> DispatchResult<Value> {
    serde_json::to_value(record)
        .map_err(|err| DispatchError::InvalidInput(format!("record encoding failed: {err}")))
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> DispatchResult<T> {
    serde_json::from_value(value)
        .map_err(|err| DispatchError::InvalidInput(format!("malformed record: {err}")))
}

fn location(
    lat: Option<f64>,
    lon: Option<f64>,
    field: &'static str,
) -> DispatchResult<LatLon> {
    match (lat, lon) {
        (Some(lat), Some(lon)) if !lat.is_nan() && !lon.is_nan() => LatLon::new(lat, lon),
        _ => Err(DispatchError::InvalidLocation { field }),
    }
}

impl RideRequest {
    pub fn to_record(&self) -> DispatchResult<Value> {
        to_value(&RideRecord {
            id: self.id.clone(),
            rider_id: self.rider_id.clone(),
            pickup_lat: Some(self.pickup.lat),
            pickup_lon: Some(self.pickup.lon),
            destination_lat: Some(self.destination.lat),
            destination_lon: Some(self.destination.lon),
            ride_type: self.ride_type,
            status: self.status,
            driver_id: self.driver_id.clone(),
            created_at_ms: self.created_at_ms,
            distance_km: self.distance_km,
            fare: self.fare,
            accepted_at_ms: self.accepted_at_ms,
            arrived_at_ms: self.arrived_at_ms,
            started_at_ms: self.started_at_ms,
            completed_at_ms: self.completed_at_ms,
            cancelled_at_ms: self.cancelled_at_ms,
            cancelled_by: self.cancelled_by.clone(),
            version: self.version,
        })
    }

    /// Decode a flat record. Missing or null coordinates fail with `InvalidLocation`.
    pub fn from_record(value: Value) -> DispatchResult<RideRequest> {
        let record: RideRecord = from_value(value)?;
        let pickup = location(record.pickup_lat, record.pickup_lon, "pickup")?;
        let destination = location(record.destination_lat, record.destination_lon, "destination")?;
        if record.status.has_driver() && record.driver_id.is_none() {
            return Err(DispatchError::InvalidInput(format!(
                "ride {} is {:?} without a driver",
                record.id, record.status
            )));
        }
        Ok(RideRequest {
            id: record.id,
            rider_id: record.rider_id,
            pickup,
            destination,
            ride_type: record.ride_type,
            status: record.status,
            driver_id: record.driver_id,
            created_at_ms: record.created_at_ms,
            distance_km: record.distance_km,
            fare: record.fare,
            accepted_at_ms: record.accepted_at_ms,
            arrived_at_ms: record.arrived_at_ms,
            started_at_ms: record.started_at_ms,
            completed_at_ms: record.completed_at_ms,
            cancelled_at_ms: record.cancelled_at_ms,
            cancelled_by: record.cancelled_by,
            version: record.version,
        })
    }
}

impl DriverLocation {
    pub fn to_record(&self) -> DispatchResult<Value> {
        to_value(&DriverLocationRecord {
            driver_id: self.driver_id.clone(),
            lat: self.position.lat,
            lon: self.position.lon,
            updated_at_ms: self.updated_at_ms,
            availability: self.availability,
        })
    }

    pub fn from_record(value: Value) -> DispatchResult<DriverLocation> {
        let record: DriverLocationRecord = from_value(value)?;
        Ok(DriverLocation {
            driver_id: record.driver_id,
            position: LatLon::new(record.lat, record.lon)?,
            updated_at_ms: record.updated_at_ms,
            availability: record.availability,
        })
    }
}
