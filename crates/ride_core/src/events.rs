//! Ride status notifications for the external UI/notification layer.
//!
//! The core only publishes what it has already persisted; subscribers receive
//! events over unbounded channels so publishing never blocks a ride write.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::ride::{RideRequest, RideStatus};
use crate::types::{DriverId, RideId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideEvent {
    pub ride_id: RideId,
    pub status: RideStatus,
    pub driver_id: Option<DriverId>,
    pub fare: Option<f64>,
    pub version: u64,
    pub at_ms: u64,
}

impl RideEvent {
    pub fn from_ride(ride: &RideRequest, at_ms: u64) -> Self {
        Self {
            ride_id: ride.id.clone(),
            status: ride.status,
            driver_id: ride.driver_id.clone(),
            fare: ride.fare,
            version: ride.version,
            at_ms,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<RideEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<RideEvent> {
        let (tx, rx) = channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, dropping the ones that hung up.
    pub fn publish(&self, event: RideEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: RideStatus) -> RideEvent {
        RideEvent {
            ride_id: "ride-1".into(),
            status,
            driver_id: None,
            fare: None,
            version: 0,
            at_ms: 0,
        }
    }

    #[test]
    fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(event(RideStatus::Searching));
        bus.publish(event(RideStatus::Cancelled));
        let received: Vec<_> = rx.try_iter().map(|e| e.status).collect();
        assert_eq!(received, vec![RideStatus::Searching, RideStatus::Cancelled]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(event(RideStatus::Searching));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_iter().count(), 1);
    }
}
