//! Ride request persistence.
//!
//! [`RideRequestStore::compare_and_set_status`] is the serialization point for a
//! ride: every status change goes through it, and a write whose expected status
//! no longer matches fails with `Conflict` without touching the stored record.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::{DispatchError, DispatchResult};
use crate::ride::{NewRideRequest, RideMutation, RideRequest, RideStatus};
use crate::sync::{lock_within, read_within, write_within};
use crate::types::{ActorId, DriverId, RideId, RiderId};

/// Position in a `created_at` descending listing: the last ride already returned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListCursor {
    pub created_at_ms: u64,
    pub ride_id: RideId,
}

impl ListCursor {
    fn of(ride: &RideRequest) -> Self {
        Self {
            created_at_ms: ride.created_at_ms,
            ride_id: ride.id.clone(),
        }
    }
}

/// Whose rides a listing walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RideOwner {
    Rider(RiderId),
    Driver(DriverId),
}

pub trait RideRequestStore: Send + Sync {
    /// Persist a new `searching` request and return its id.
    fn create(&self, request: NewRideRequest, created_at_ms: u64) -> DispatchResult<RideId>;

    fn get(&self, ride_id: &RideId) -> DispatchResult<RideRequest>;

    /// Atomically move `ride_id` from `expected` to `new_status`, applying `mutation`
    /// in the same write. Returns the stored record after the write.
    fn compare_and_set_status(
        &self,
        ride_id: &RideId,
        expected: RideStatus,
        new_status: RideStatus,
        mutation: RideMutation,
    ) -> DispatchResult<RideRequest>;

    /// One page of `owner`'s rides, newest first, strictly after `after`.
    fn list_page(
        &self,
        owner: &RideOwner,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> DispatchResult<Vec<RideRequest>>;
}

/// Lazy, finite listing of an owner's rides, newest first.
///
/// Pages are fetched on demand; [`RideListing::restart`] rewinds to the newest ride.
pub struct RideListing<'a> {
    store: &'a dyn RideRequestStore,
    owner: RideOwner,
    page_size: usize,
    cursor: Option<ListCursor>,
    buffer: VecDeque<RideRequest>,
    exhausted: bool,
}

impl<'a> RideListing<'a> {
    pub fn new(store: &'a dyn RideRequestStore, owner: RideOwner, page_size: usize) -> Self {
        Self {
            store,
            owner,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn by_rider(store: &'a dyn RideRequestStore, rider_id: RiderId) -> Self {
        Self::new(store, RideOwner::Rider(rider_id), 50)
    }

    pub fn by_driver(store: &'a dyn RideRequestStore, driver_id: DriverId) -> Self {
        Self::new(store, RideOwner::Driver(driver_id), 50)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }
}

impl Iterator for RideListing<'_> {
    type Item = DispatchResult<RideRequest>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self
                .store
                .list_page(&self.owner, self.cursor.as_ref(), self.page_size)
            {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        let ride = self.buffer.pop_front()?;
        self.cursor = Some(ListCursor::of(&ride));
        Some(Ok(ride))
    }
}

type OwnerIndex = HashMap<ActorId, BTreeSet<(u64, RideId)>>;

/// In-memory [`RideRequestStore`] with one lock per ride.
///
/// The ride map lock is held only to look up or insert an entry; status writes
/// lock just the ride they touch, so rides never contend with each other.
pub struct InMemoryRideStore {
    rides: RwLock<HashMap<RideId, Arc<Mutex<RideRequest>>>>,
    by_rider: RwLock<OwnerIndex>,
    by_driver: RwLock<OwnerIndex>,
    timeout: Duration,
}

impl InMemoryRideStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            rides: RwLock::new(HashMap::new()),
            by_rider: RwLock::new(HashMap::new()),
            by_driver: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        read_within(&self.rides, self.timeout, "ride count")
            .map(|rides| rides.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, ride_id: &RideId) -> DispatchResult<Arc<Mutex<RideRequest>>> {
        let rides = read_within(&self.rides, self.timeout, "ride lookup")?;
        rides
            .get(ride_id)
            .cloned()
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.clone()))
    }

    fn reindex_driver(
        &self,
        before: &RideRequest,
        after: &RideRequest,
    ) -> DispatchResult<()> {
        if before.driver_id == after.driver_id {
            return Ok(());
        }
        let key = (after.created_at_ms, after.id.clone());
        let mut by_driver = write_within(&self.by_driver, self.timeout, "driver index")?;
        if let Some(old) = &before.driver_id {
            if let Some(rides) = by_driver.get_mut(old) {
                rides.remove(&key);
            }
        }
        if let Some(new) = &after.driver_id {
            by_driver.entry(new.clone()).or_default().insert(key);
        }
        Ok(())
    }
}

impl Default for InMemoryRideStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl RideRequestStore for InMemoryRideStore {
    fn create(&self, request: NewRideRequest, created_at_ms: u64) -> DispatchResult<RideId> {
        let ride = request.into_request(created_at_ms)?;
        let ride_id = ride.id.clone();
        let index_key = (ride.created_at_ms, ride.id.clone());
        let rider_id = ride.rider_id.clone();

        let mut rides = write_within(&self.rides, self.timeout, "ride create")?;
        if rides.contains_key(&ride_id) {
            return Err(DispatchError::DuplicateId(ride_id));
        }
        let mut by_rider = write_within(&self.by_rider, self.timeout, "rider index")?;
        rides.insert(ride_id.clone(), Arc::new(Mutex::new(ride)));
        by_rider.entry(rider_id).or_default().insert(index_key);
        Ok(ride_id)
    }

    fn get(&self, ride_id: &RideId) -> DispatchResult<RideRequest> {
        let entry = self.entry(ride_id)?;
        let ride = lock_within(&entry, self.timeout, "ride get")?;
        Ok(ride.clone())
    }

    fn compare_and_set_status(
        &self,
        ride_id: &RideId,
        expected: RideStatus,
        new_status: RideStatus,
        mutation: RideMutation,
    ) -> DispatchResult<RideRequest> {
        let entry = self.entry(ride_id)?;
        let mut ride = lock_within(&entry, self.timeout, "ride compare-and-set")?;
        if ride.status != expected {
            return Err(DispatchError::Conflict {
                ride_id: ride_id.clone(),
                expected,
                actual: ride.status,
            });
        }
        let next = mutation.apply(&ride, new_status)?;
        self.reindex_driver(&ride, &next)?;
        *ride = next;
        Ok(ride.clone())
    }

    fn list_page(
        &self,
        owner: &RideOwner,
        after: Option<&ListCursor>,
        limit: usize,
    ) -> DispatchResult<Vec<RideRequest>> {
        let (index, actor_id) = match owner {
            RideOwner::Rider(rider_id) => (&self.by_rider, rider_id),
            RideOwner::Driver(driver_id) => (&self.by_driver, driver_id),
        };
        let ids: Vec<RideId> = {
            let index = read_within(index, self.timeout, "ride listing")?;
            let Some(keys) = index.get(actor_id) else {
                return Ok(Vec::new());
            };
            let page = match after {
                Some(cursor) => keys.range(..(cursor.created_at_ms, cursor.ride_id.clone())),
                None => keys.range(..),
            };
            page.rev().take(limit).map(|(_, id)| id.clone()).collect()
        };
        ids.iter().map(|ride_id| self.get(ride_id)).collect()
    }
}
