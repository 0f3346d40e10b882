//! Load tests for ride_core: validate throughput and invariants under concurrent traffic.

use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use ride_core::config::ServiceConfig;
use ride_core::fare::RideType;
use ride_core::ride::RideStatus;
use ride_core::test_helpers::{
    manual_service, online_driver, request_trip, scatter_positions, test_pickup,
};
use ride_core::{Actor, ErrorKind};

#[test]
#[ignore] // Only run explicitly: cargo test --package ride_core --test load_tests -- --ignored
fn test_sustained_dispatch_load() {
    const DRIVERS: usize = 400;
    const RIDES: usize = 200;
    const THREADS: usize = 8;

    let (service, _clock) = manual_service(ServiceConfig::default()).expect("service");
    let drivers: Vec<Actor> = scatter_positions(test_pickup(), DRIVERS, 5.0, 42)
        .into_iter()
        .enumerate()
        .map(|(i, position)| {
            online_driver(&service, &format!("driver-{i}"), position).expect("online driver")
        })
        .collect();
    let rides: Vec<_> = scatter_positions(test_pickup(), RIDES, 3.0, 7)
        .into_iter()
        .enumerate()
        .map(|(i, pickup)| {
            let rider = Actor::rider(format!("rider-{i}"));
            request_trip(&service, &rider, pickup, 4.0, RideType::Car).expect("request")
        })
        .collect();

    let start = Instant::now();
    let barrier = Barrier::new(THREADS);
    thread::scope(|scope| {
        for worker in 0..THREADS {
            let service = &service;
            let rides = &rides;
            let drivers = &drivers;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                // Workers walk the rides in different orders to maximize contention.
                // A driver raced onto two rides at once keeps one and rolls the other back.
                for step in 0..rides.len() {
                    let ride = &rides[(step + worker * 17) % rides.len()];
                    let candidates = service.find_candidates(&ride.id, None).expect("candidates");
                    for candidate in candidates.iter().take(3) {
                        let Some(driver) = drivers.iter().find(|d| d.id == candidate.driver_id)
                        else {
                            continue;
                        };
                        match service.accept_ride(driver, &ride.id) {
                            Ok(_) => break,
                            Err(err) => assert!(
                                matches!(
                                    err.kind(),
                                    ErrorKind::AlreadyTaken
                                        | ErrorKind::Conflict
                                        | ErrorKind::AssignmentFailed
                                ),
                                "unexpected accept error: {err}"
                            ),
                        }
                    }
                }
            });
        }
    });
    let duration = start.elapsed();

    let stats = service.stats();
    let attempts = stats.accepts_won + stats.accepts_lost;
    println!(
        "Sustained dispatch load: {} accepts ({} won) in {:.2}s ({:.0} accepts/sec)",
        attempts,
        stats.accepts_won,
        duration.as_secs_f64(),
        attempts as f64 / duration.as_secs_f64()
    );

    // Single assignment held under contention.
    let mut bound = 0;
    for driver in &drivers {
        let record = service.driver(&driver.id).expect("driver");
        if let Some(ride_id) = record.current_ride {
            bound += 1;
            let ride = service.ride(&ride_id).expect("ride");
            assert_eq!(ride.status, RideStatus::Accepted);
            assert_eq!(ride.driver_id.as_ref(), Some(&driver.id));
        }
    }
    assert_eq!(bound as u64, stats.accepts_won);
    assert!(duration.as_secs_f64() < 30.0, "dispatch too slow: {duration:?}");
}

#[test]
#[ignore]
fn test_location_report_throughput() {
    let (service, clock) = manual_service(ServiceConfig::default()).expect("service");
    let positions = scatter_positions(test_pickup(), 1_000, 8.0, 3);
    let drivers: Vec<Actor> = positions
        .iter()
        .enumerate()
        .map(|(i, position)| online_driver(&service, &format!("d{i}"), *position).expect("online"))
        .collect();

    let start = Instant::now();
    let mut reports = 0u64;
    for round in 0..20 {
        clock.advance_secs(15);
        for (driver, position) in drivers.iter().zip(&positions) {
            let moved = position.offset((round * 18) as f64, 0.05);
            service
                .report_location(driver, moved.lat, moved.lon)
                .expect("report");
            reports += 1;
        }
    }
    let duration = start.elapsed();
    let per_sec = reports as f64 / duration.as_secs_f64();
    println!("Location reports: {reports} in {:.2}s ({per_sec:.0}/sec)", duration.as_secs_f64());
    assert!(per_sec > 10_000.0, "report throughput too low: {per_sec:.0}/sec");
}
