//! Dispatch a batch of rides around Islamabad and print the outcome.
//!
//! Run with: cargo run -p ride_core --example dispatch_run
//! Set RUST_LOG=ride_core=debug to see lost races and retries.

use ride_core::config::ServiceConfig;
use ride_core::fare::RideType;
use ride_core::ride::RideStatus;
use ride_core::test_helpers::{
    manual_service, online_driver, request_trip, scatter_positions, test_pickup,
};
use ride_core::{Actor, DispatchResult, ErrorKind};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    const NUM_DRIVERS: usize = 40;
    const NUM_RIDES: usize = 25;

    let (service, clock) = manual_service(ServiceConfig::default())?;
    let positions = scatter_positions(test_pickup(), NUM_DRIVERS, 6.0, 123);
    let drivers: Vec<Actor> = positions
        .iter()
        .enumerate()
        .map(|(i, position)| online_driver(&service, &format!("driver-{i:02}"), *position))
        .collect::<DispatchResult<_>>()?;
    let ride_types = [RideType::Bike, RideType::Car, RideType::CarPlus, RideType::Premium];

    let mut unmatched = 0;
    for (i, pickup) in scatter_positions(test_pickup(), NUM_RIDES, 3.0, 7)
        .into_iter()
        .enumerate()
    {
        clock.advance_secs(20);
        for (driver, position) in drivers.iter().zip(&positions) {
            service.report_location(driver, position.lat, position.lon)?;
        }
        let rider = Actor::rider(format!("rider-{i:02}"));
        let trip_km = 1.0 + (i % 8) as f64;
        let ride = request_trip(&service, &rider, pickup, trip_km, ride_types[i % 4])?;

        let mut assigned = None;
        for candidate in service.find_candidates(&ride.id, None)? {
            let Some(driver) = drivers.iter().find(|d| d.id == candidate.driver_id) else {
                continue;
            };
            match service.accept_ride(driver, &ride.id) {
                Ok(_) => {
                    assigned = Some(driver);
                    break;
                }
                Err(err) if err.kind() == ErrorKind::AlreadyTaken => break,
                Err(err) if err.kind() == ErrorKind::Conflict => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let Some(driver) = assigned else {
            service.cancel_ride(&rider, &ride.id)?;
            unmatched += 1;
            continue;
        };
        if i % 6 == 5 {
            // Some riders change their mind after pickup is under way.
            service.mark_arrived(driver, &ride.id)?;
            service.cancel_ride(&rider, &ride.id)?;
            continue;
        }
        service.mark_arrived(driver, &ride.id)?;
        service.start_ride(driver, &ride.id)?;
        clock.advance_secs(60 * trip_km as u64);
        service.complete_ride(driver, &ride.id)?;
    }

    let stats = service.stats();
    println!("--- Dispatch run ({NUM_RIDES} rides, {NUM_DRIVERS} drivers, seed 123) ---");
    println!("Requested: {}", stats.rides_requested);
    println!("Completed: {}", stats.rides_completed);
    println!("Cancelled: {} ({} unmatched)", stats.rides_cancelled, unmatched);
    println!("Gross fare: {:.2}", stats.gross_fare);
    println!("Accept win rate: {:.1}%", stats.accept_win_rate() * 100.0);

    println!("\nTop earners:");
    let mut earners = drivers
        .iter()
        .map(|driver| service.driver(&driver.id))
        .collect::<DispatchResult<Vec<_>>>()?;
    earners.sort_by(|a, b| b.total_earnings.total_cmp(&a.total_earnings));
    for record in earners.iter().take(5).filter(|r| r.trips_completed > 0) {
        println!(
            "  {}  trips={}  earnings={:.2}",
            record.driver_id, record.trips_completed, record.total_earnings
        );
    }

    let first_rider: Vec<_> = service
        .rides_for_rider("rider-00".into())
        .collect::<DispatchResult<_>>()?;
    if let Some(ride) = first_rider.first() {
        let status = match ride.status {
            RideStatus::Completed => format!("completed, fare {:.2}", ride.fare.unwrap_or_default()),
            other => format!("{other:?}"),
        };
        println!("\nrider-00 ride {}: {status}", ride.id);
        println!("{}", ride.to_record()?);
    }
    Ok(())
}
