use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rookery::{Kind, Mode, Reactor};

mod util;

use util::init;

#[test]
fn one_shot_fires_once() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    handle
        .add_timer(Duration::from_millis(50), false, move |_, kind| {
            assert_eq!(kind, Kind::Timer);
            let _ = tx.send(started.elapsed());
        })
        .unwrap();

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(first >= Duration::from_millis(50), "fired early: {:?}", first);
    // One-shot: no second fire.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn series_fires_three_times_in_350ms() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let fires = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&fires);
    let started = Instant::now();
    handle
        .add_timer(Duration::from_millis(100), true, move |_, _| {
            record.lock().unwrap().push(started.elapsed());
        })
        .unwrap();

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    thread::sleep(Duration::from_millis(350));
    stopper.stop();
    runner.join().unwrap();

    let fires = fires.lock().unwrap();
    assert_eq!(fires.len(), 3, "fires: {:?}", *fires);
    for window in fires.windows(2) {
        let gap = window[1] - window[0];
        // Consecutive series fires are spaced at least a period apart,
        // modulo dispatch latency.
        assert!(gap >= Duration::from_millis(85), "gap too small: {:?}", gap);
    }
}

#[test]
fn timer_mode_disarms_and_rearms() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let (tx, rx) = mpsc::channel();
    let id = handle
        .add_timer(Duration::from_millis(40), true, move |_, _| {
            let _ = tx.send(());
        })
        .unwrap();
    handle.mode(id, Kind::Timer, Mode::Disabled);

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    handle.mode(id, Kind::Timer, Mode::Enabled);
    rx.recv_timeout(Duration::from_secs(2))
        .expect("re-armed timer never fired");

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn zero_delay_rejected() {
    init();
    let reactor = Reactor::new().unwrap();
    assert!(reactor
        .handle()
        .add_timer(Duration::ZERO, false, |_, _| {})
        .is_err());
}
