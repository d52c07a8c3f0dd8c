use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rookery::Reactor;

mod util;

use util::init;

#[test]
fn tokens_arrive_in_write_order() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let (tx, rx) = mpsc::channel();
    let sid = handle
        .upstream(move |token| {
            let _ = tx.send(token);
        })
        .unwrap();

    for token in [1u64, 2, 3, u64::MAX] {
        handle.notify(sid, token).unwrap();
    }

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
    assert_eq!(seen, vec![1, 2, 3, u64::MAX]);

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn wakeup_from_another_thread() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let (tx, rx) = mpsc::channel();
    let sid = handle
        .upstream(move |token| {
            let _ = tx.send(token);
        })
        .unwrap();

    let producer = handle.clone();
    let feeder = thread::spawn(move || {
        for token in 0..100u64 {
            producer.notify(sid, token).unwrap();
        }
    });

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    for expected in 0..100u64 {
        let token = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token, expected);
    }

    feeder.join().unwrap();
    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn erase_invalidates_the_channel() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let sid = handle.upstream(|_| {}).unwrap();
    assert!(handle.erase_upstream(sid));
    assert!(!handle.erase_upstream(sid));
    assert!(handle.notify(sid, 7).is_err());
}
