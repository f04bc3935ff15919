//! Timing tests for the change scheduler.
//!
//! These run against the real timer thread. Assertions on elapsed time only use lower
//! bounds, since the debounce window is a quiescence heuristic and delivery may be late.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use hotswap::prelude::*;

#[derive(Default)]
struct Recorder {
    deliveries: Mutex<Vec<(Instant, Vec<String>, usize)>>,
}

impl ChangeListener for Recorder {
    fn after_change(&self, changed: &[ChangedUnit], added: &[NewUnit]) {
        self.deliveries.lock().unwrap().push((
            Instant::now(),
            changed.iter().map(|unit| unit.id.name.clone()).collect(),
            added.len(),
        ));
    }
}

fn changed(name: &str) -> ChangedUnit {
    ChangedUnit {
        id: UnitId::new(name, LoaderId(1)),
        previous: Arc::from(&b"previous"[..]),
        current: Arc::from(&b"current"[..]),
    }
}

fn scheduler(window: Duration) -> Result<(ChangeScheduler, Arc<Recorder>)> {
    let recorder = Arc::new(Recorder::default());
    let notifier = Arc::new(ChangeNotifier::new());
    notifier.add_listener(recorder.clone());
    Ok((ChangeScheduler::new(window, notifier)?, recorder))
}

#[test]
fn two_redefinitions_within_the_window_fire_once() -> Result<()> {
    let window = Duration::from_millis(300);
    let (scheduler, recorder) = scheduler(window)?;

    scheduler.enqueue_changed(changed("a.A"));
    thread::sleep(Duration::from_millis(100));
    let second = Instant::now();
    scheduler.enqueue_changed(changed("a.B"));
    assert!(scheduler.is_waiting());

    assert!(scheduler.wait_for_settle_timeout(Duration::from_secs(5)));
    assert!(!scheduler.is_waiting());

    let deliveries = recorder.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (at, names, _) = &deliveries[0];
    assert_eq!(names, &vec!["a/A".to_string(), "a/B".to_string()]);
    assert!(at.duration_since(second) >= window);
    Ok(())
}

#[test]
fn many_enqueues_collapse_into_one_notification() -> Result<()> {
    let (scheduler, recorder) = scheduler(Duration::from_millis(150))?;

    for index in 0..50 {
        scheduler.enqueue_changed(changed(&format!("a.T{index}")));
    }
    scheduler.enqueue_added(NewUnit {
        id: UnitId::new("a.Fresh", LoaderId(1)),
    });
    scheduler.wait_for_settle();

    let deliveries = recorder.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].1.len(), 50);
    assert_eq!(deliveries[0].2, 1);
    Ok(())
}

#[test]
fn pending_verification_delays_notification() -> Result<()> {
    let window = Duration::from_millis(50);
    let (scheduler, recorder) = scheduler(window)?;

    scheduler.begin_verification();
    scheduler.enqueue_changed(changed("a.A"));
    assert!(!scheduler.wait_for_settle_timeout(window * 6));
    assert!(recorder.deliveries.lock().unwrap().is_empty());
    assert_eq!(scheduler.pending_verification(), 1);

    let released = Instant::now();
    scheduler.end_verification();
    assert!(scheduler.wait_for_settle_timeout(Duration::from_secs(5)));

    let deliveries = recorder.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(deliveries[0].0 >= released);
    Ok(())
}

#[test]
fn separate_bursts_fire_separately() -> Result<()> {
    let (scheduler, recorder) = scheduler(Duration::from_millis(50))?;

    scheduler.enqueue_changed(changed("a.A"));
    assert!(scheduler.wait_for_settle_timeout(Duration::from_secs(5)));
    scheduler.enqueue_changed(changed("a.B"));
    assert!(scheduler.wait_for_settle_timeout(Duration::from_secs(5)));

    let deliveries = recorder.deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].1, vec!["a/A".to_string()]);
    assert_eq!(deliveries[1].1, vec!["a/B".to_string()]);
    Ok(())
}

#[test]
fn shutdown_stops_delivery() -> Result<()> {
    let (scheduler, recorder) = scheduler(Duration::from_millis(50))?;
    scheduler.enqueue_changed(changed("a.A"));
    scheduler.shutdown();
    thread::sleep(Duration::from_millis(150));
    assert!(recorder.deliveries.lock().unwrap().is_empty());
    Ok(())
}
