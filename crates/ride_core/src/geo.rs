//! Spatial operations: coordinates, haversine distance and the driver geo index.
//!
//! This module provides:
//!
//! - **LatLon**: validated WGS84 coordinate pair
//! - **haversine_km**: great-circle distance with Earth radius 6371 km
//! - **GeoIndex**: the interface dispatch uses for radius queries
//! - **H3GeoIndex**: in-memory index that buckets drivers by H3 cell and refines
//!   bucket hits with exact haversine distance
//!
//! Default bucket resolution is 7 (~1.4 km edge), suitable for dispatch radii of a few km.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use h3o::{CellIndex, LatLng, Resolution};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};
use crate::sync::{read_within, write_within};
use crate::types::DriverId;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Grid disks larger than this fall back to a full scan.
const MAX_DISK_K: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    /// Validated constructor: rejects NaN/infinite values and out-of-range coordinates.
    pub fn new(lat: f64, lon: f64) -> DispatchResult<Self> {
        let point = Self { lat, lon };
        point.validate()?;
        Ok(point)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        let in_range = self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon);
        if in_range {
            Ok(())
        } else {
            Err(DispatchError::InvalidCoordinate {
                lat: self.lat,
                lon: self.lon,
            })
        }
    }

    pub fn distance_km(&self, other: &LatLon) -> f64 {
        haversine_km(*self, *other)
    }

    /// Point reached by travelling `distance_km` from here along `bearing_deg`.
    pub fn offset(&self, bearing_deg: f64, distance_km: f64) -> LatLon {
        let angular = distance_km / EARTH_RADIUS_KM;
        let bearing = bearing_deg.to_radians();
        let lat1 = self.lat.to_radians();
        let lon1 = self.lon.to_radians();
        let lat2 =
            (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
        let lon2 = lon1
            + (bearing.sin() * angular.sin() * lat1.cos())
                .atan2(angular.cos() - lat1.sin() * lat2.sin());
        let lon2 = (lon2.to_degrees() + 540.0) % 360.0 - 180.0;
        LatLon {
            lat: lat2.to_degrees(),
            lon: lon2,
        }
    }

    fn to_cell(self, resolution: Resolution) -> Option<CellIndex> {
        LatLng::new(self.lat, self.lon)
            .ok()
            .map(|coord| coord.to_cell(resolution))
    }
}

/// Haversine great-circle distance in kilometers.
///
/// The operation order is fixed so results are reproducible bit for bit.
pub fn haversine_km(a: LatLon, b: LatLon) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Idle,
    InRide,
    Offline,
}

/// Last reported position of a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub driver_id: DriverId,
    pub position: LatLon,
    pub updated_at_ms: u64,
    pub availability: Availability,
}

impl DriverLocation {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.updated_at_ms)
    }

    pub fn is_stale(&self, now_ms: u64, max_age_ms: u64) -> bool {
        self.age_ms(now_ms) > max_age_ms
    }
}

/// Restricts which drivers a nearby query returns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearbyFilter {
    /// Only drivers in this state; `None` accepts any state except offline.
    pub availability: Option<Availability>,
    pub now_ms: u64,
    pub max_age_ms: u64,
    pub limit: Option<usize>,
}

impl NearbyFilter {
    pub fn idle(now_ms: u64, max_age_ms: u64) -> Self {
        Self {
            availability: Some(Availability::Idle),
            now_ms,
            max_age_ms,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn accepts(&self, location: &DriverLocation) -> bool {
        let state_ok = match self.availability {
            Some(wanted) => location.availability == wanted,
            None => location.availability != Availability::Offline,
        };
        state_ok && !location.is_stale(self.now_ms, self.max_age_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub distance_km: f64,
    pub location: DriverLocation,
}

/// Driver position index used by dispatch and telemetry.
///
/// Implementations must replace records atomically (a query never observes a
/// half-written location) and return each driver at most once per query.
pub trait GeoIndex: Send + Sync {
    /// Insert or overwrite a driver's position. Reports older than the stored one are
    /// ignored, which makes repeated or reordered reports harmless.
    fn upsert(
        &self,
        driver_id: &DriverId,
        position: LatLon,
        availability: Availability,
        timestamp_ms: u64,
    ) -> DispatchResult<()>;

    /// Change availability without moving the driver. Returns `false` if the driver
    /// has never reported a position.
    fn set_availability(
        &self,
        driver_id: &DriverId,
        availability: Availability,
    ) -> DispatchResult<bool>;

    /// Change availability only while it is still `expected`, so an explicit
    /// `offline` is not overwritten by ride bookkeeping. Returns whether it changed.
    fn set_availability_if(
        &self,
        driver_id: &DriverId,
        expected: Availability,
        availability: Availability,
    ) -> DispatchResult<bool>;

    fn get(&self, driver_id: &DriverId) -> DispatchResult<Option<DriverLocation>>;

    /// Drivers within `radius_km` of `center`, ascending by distance.
    fn query_nearby(
        &self,
        center: LatLon,
        radius_km: f64,
        filter: NearbyFilter,
    ) -> DispatchResult<Vec<NearbyDriver>>;

    /// All drivers not yet offline whose last report is older than `max_age_ms`.
    fn stale_drivers(&self, now_ms: u64, max_age_ms: u64) -> DispatchResult<Vec<DriverId>>;
}

#[derive(Debug, Default)]
struct IndexState {
    locations: HashMap<DriverId, (DriverLocation, CellIndex)>,
    drivers_by_cell: HashMap<CellIndex, HashSet<DriverId>>,
}

impl IndexState {
    fn remove_from_cell(&mut self, driver_id: &DriverId, cell: CellIndex) {
        if let Some(drivers) = self.drivers_by_cell.get_mut(&cell) {
            drivers.remove(driver_id);
            if drivers.is_empty() {
                self.drivers_by_cell.remove(&cell);
            }
        }
    }
}

/// In-memory [`GeoIndex`] that buckets drivers by H3 cell.
///
/// Radius queries gather candidates from a grid disk around the center cell and
/// keep only those whose exact haversine distance is within the radius.
pub struct H3GeoIndex {
    resolution: Resolution,
    state: RwLock<IndexState>,
    disk_cache: Mutex<LruCache<(CellIndex, u32), Arc<[CellIndex]>>>,
    lock_timeout: Duration,
}

impl H3GeoIndex {
    pub fn new(resolution: Resolution, lock_timeout: Duration) -> Self {
        Self {
            resolution,
            state: RwLock::new(IndexState::default()),
            disk_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(1_000).expect("cache size must be non-zero"),
            )),
            lock_timeout,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Number of drivers that have ever reported a position.
    pub fn len(&self) -> usize {
        read_within(&self.state, self.lock_timeout, "geo len")
            .map(|state| state.locations.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ring count whose grid disk covers `radius_km`, or `None` when a full scan is cheaper.
    fn disk_k_for(&self, radius_km: f64) -> Option<u32> {
        let edge_km = self.resolution.edge_length_km();
        let k = (2.0 * radius_km / edge_km).ceil() + 1.0;
        (k <= MAX_DISK_K as f64).then_some(k as u32)
    }

    fn grid_disk(&self, origin: CellIndex, k: u32) -> Arc<[CellIndex]> {
        let compute = || -> Arc<[CellIndex]> { origin.grid_disk::<Vec<_>>(k).into() };
        let mut cache = match self.disk_cache.lock() {
            Ok(guard) => guard,
            Err(_) => return compute(), // Fallback: compute without cache if mutex poisoned
        };
        cache.get_or_insert((origin, k), compute).clone()
    }
}

impl Default for H3GeoIndex {
    fn default() -> Self {
        Self::new(Resolution::Seven, Duration::from_secs(2))
    }
}

impl GeoIndex for H3GeoIndex {
    fn upsert(
        &self,
        driver_id: &DriverId,
        position: LatLon,
        availability: Availability,
        timestamp_ms: u64,
    ) -> DispatchResult<()> {
        position.validate()?;
        let cell = position
            .to_cell(self.resolution)
            .ok_or(DispatchError::InvalidCoordinate {
                lat: position.lat,
                lon: position.lon,
            })?;
        let mut state = write_within(&self.state, self.lock_timeout, "geo upsert")?;
        if let Some((existing, old_cell)) = state.locations.get(driver_id) {
            if existing.updated_at_ms > timestamp_ms {
                return Ok(());
            }
            let old_cell = *old_cell;
            if old_cell != cell {
                state.remove_from_cell(driver_id, old_cell);
            }
        }
        let location = DriverLocation {
            driver_id: driver_id.clone(),
            position,
            updated_at_ms: timestamp_ms,
            availability,
        };
        state.locations.insert(driver_id.clone(), (location, cell));
        state
            .drivers_by_cell
            .entry(cell)
            .or_default()
            .insert(driver_id.clone());
        Ok(())
    }

    fn set_availability(
        &self,
        driver_id: &DriverId,
        availability: Availability,
    ) -> DispatchResult<bool> {
        let mut state = write_within(&self.state, self.lock_timeout, "geo availability")?;
        match state.locations.get_mut(driver_id) {
            Some((location, _)) => {
                location.availability = availability;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_availability_if(
        &self,
        driver_id: &DriverId,
        expected: Availability,
        availability: Availability,
    ) -> DispatchResult<bool> {
        let mut state = write_within(&self.state, self.lock_timeout, "geo availability")?;
        match state.locations.get_mut(driver_id) {
            Some((location, _)) if location.availability == expected => {
                location.availability = availability;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, driver_id: &DriverId) -> DispatchResult<Option<DriverLocation>> {
        let state = read_within(&self.state, self.lock_timeout, "geo get")?;
        Ok(state
            .locations
            .get(driver_id)
            .map(|(location, _)| location.clone()))
    }

    fn query_nearby(
        &self,
        center: LatLon,
        radius_km: f64,
        filter: NearbyFilter,
    ) -> DispatchResult<Vec<NearbyDriver>> {
        center.validate()?;
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(DispatchError::InvalidInput(format!(
                "radius must be a non-negative number of km, got {radius_km}"
            )));
        }
        let disk = match (center.to_cell(self.resolution), self.disk_k_for(radius_km)) {
            (Some(origin), Some(k)) => Some(self.grid_disk(origin, k)),
            _ => None,
        };

        let state = read_within(&self.state, self.lock_timeout, "geo query")?;
        let consider = |location: &DriverLocation, found: &mut Vec<NearbyDriver>| {
            if !filter.accepts(location) {
                return;
            }
            let distance_km = haversine_km(center, location.position);
            if distance_km <= radius_km {
                found.push(NearbyDriver {
                    driver_id: location.driver_id.clone(),
                    distance_km,
                    location: location.clone(),
                });
            }
        };

        // A driver lives in exactly one bucket and disk cells are distinct,
        // so neither path can yield a driver twice.
        let mut found = Vec::new();
        match disk {
            Some(cells) => {
                for cell in cells.iter() {
                    let Some(drivers) = state.drivers_by_cell.get(cell) else {
                        continue;
                    };
                    for driver_id in drivers {
                        if let Some((location, _)) = state.locations.get(driver_id) {
                            consider(location, &mut found);
                        }
                    }
                }
            }
            None => {
                for (location, _) in state.locations.values() {
                    consider(location, &mut found);
                }
            }
        }
        drop(state);

        found.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    fn stale_drivers(&self, now_ms: u64, max_age_ms: u64) -> DispatchResult<Vec<DriverId>> {
        let state = read_within(&self.state, self.lock_timeout, "geo stale scan")?;
        Ok(state
            .locations
            .values()
            .filter(|(location, _)| {
                location.availability != Availability::Offline
                    && location.is_stale(now_ms, max_age_ms)
            })
            .map(|(location, _)| location.driver_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn islamabad() -> LatLon {
        LatLon::new(33.6844, 73.0479).expect("valid")
    }

    #[test]
    fn haversine_matches_known_distance() {
        // One degree of latitude is ~111.195 km on a 6371 km sphere.
        let a = LatLon::new(0.0, 0.0).expect("valid");
        let b = LatLon::new(1.0, 0.0).expect("valid");
        let d = haversine_km(a, b);
        assert!((d - 111.194_926_6).abs() < 1e-6, "got {d}");
        assert_eq!(haversine_km(a, a), 0.0);
        assert_eq!(haversine_km(a, b), haversine_km(b, a));
    }

    #[test]
    fn offset_travels_requested_distance() {
        let origin = islamabad();
        for bearing in [0.0, 45.0, 90.0, 200.0] {
            let target = origin.offset(bearing, 5.0);
            let d = origin.distance_km(&target);
            assert!((d - 5.0).abs() < 1e-9, "bearing {bearing}: {d}");
        }
    }

    #[test]
    fn rejects_out_of_range_and_nan_coordinates() {
        assert!(LatLon::new(91.0, 0.0).is_err());
        assert!(LatLon::new(0.0, -180.5).is_err());
        assert!(LatLon::new(f64::NAN, 0.0).is_err());
        assert!(LatLon::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn query_orders_by_distance_and_respects_radius() {
        let index = H3GeoIndex::default();
        let center = islamabad();
        index
            .upsert(&"far".into(), center.offset(90.0, 3.0), Availability::Idle, 0)
            .expect("upsert");
        index
            .upsert(&"near".into(), center.offset(0.0, 1.0), Availability::Idle, 0)
            .expect("upsert");
        index
            .upsert(&"outside".into(), center.offset(180.0, 7.0), Availability::Idle, 0)
            .expect("upsert");

        let found = index
            .query_nearby(center, 6.0, NearbyFilter::idle(0, 45_000))
            .expect("query");
        let ids: Vec<_> = found.iter().map(|n| n.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert!((found[0].distance_km - 1.0).abs() < 1e-9);
    }

    #[test]
    fn moving_driver_is_returned_once() {
        let index = H3GeoIndex::default();
        let center = islamabad();
        let driver: DriverId = "mover".into();
        for step in 0..10u64 {
            let position = center.offset(45.0, step as f64 * 0.4);
            index
                .upsert(&driver, position, Availability::Idle, step)
                .expect("upsert");
        }
        let found = index
            .query_nearby(center, 6.0, NearbyFilter::idle(10, 45_000))
            .expect("query");
        assert_eq!(found.len(), 1);
        assert!((found[0].distance_km - 3.6).abs() < 1e-9);
    }

    #[test]
    fn older_reports_do_not_overwrite_newer_ones() {
        let index = H3GeoIndex::default();
        let center = islamabad();
        let driver: DriverId = "d1".into();
        index
            .upsert(&driver, center, Availability::Idle, 2_000)
            .expect("upsert");
        index
            .upsert(&driver, center.offset(0.0, 2.0), Availability::Idle, 1_000)
            .expect("late report");
        let stored = index.get(&driver).expect("get").expect("present");
        assert_eq!(stored.position, center);
        assert_eq!(stored.updated_at_ms, 2_000);
    }

    #[test]
    fn stale_and_unavailable_drivers_are_filtered() {
        let index = H3GeoIndex::default();
        let center = islamabad();
        index
            .upsert(&"stale".into(), center, Availability::Idle, 0)
            .expect("upsert");
        index
            .upsert(&"busy".into(), center, Availability::InRide, 50_000)
            .expect("upsert");
        index
            .upsert(&"fresh".into(), center, Availability::Idle, 50_000)
            .expect("upsert");

        let idle = index
            .query_nearby(center, 1.0, NearbyFilter::idle(60_000, 45_000))
            .expect("query");
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].driver_id.as_str(), "fresh");

        let stale = index.stale_drivers(60_000, 45_000).expect("scan");
        assert_eq!(stale, vec![DriverId::from("stale")]);
    }

    #[test]
    fn conditional_availability_keeps_offline() {
        let index = H3GeoIndex::default();
        let driver: DriverId = "d1".into();
        index
            .upsert(&driver, islamabad(), Availability::InRide, 0)
            .expect("upsert");
        index
            .set_availability(&driver, Availability::Offline)
            .expect("offline");

        let changed = index
            .set_availability_if(&driver, Availability::InRide, Availability::Idle)
            .expect("conditional");
        assert!(!changed);
        let stored = index.get(&driver).expect("get").expect("present");
        assert_eq!(stored.availability, Availability::Offline);

        assert!(!index
            .set_availability_if(&"ghost".into(), Availability::Idle, Availability::InRide)
            .expect("unknown driver"));
    }

    #[test]
    fn huge_radius_falls_back_to_full_scan() {
        let index = H3GeoIndex::default();
        let center = islamabad();
        index
            .upsert(
                &"lahore".into(),
                LatLon::new(31.5204, 74.3587).expect("valid"),
                Availability::Idle,
                0,
            )
            .expect("upsert");
        let found = index
            .query_nearby(center, 500.0, NearbyFilter::idle(0, 45_000))
            .expect("query");
        assert_eq!(found.len(), 1);
        assert!(found[0].distance_km > 250.0 && found[0].distance_km < 300.0);
    }
}
