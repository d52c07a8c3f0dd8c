use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rookery::{Handle, Kind, Mode, Reactor};

mod util;

use util::{assert_send, assert_sync, init, raw};

fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let connected = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    connected.set_nonblocking(true).unwrap();
    (connected, accepted)
}

#[test]
fn handle_is_send_and_sync() {
    assert_send::<Handle>();
    assert_sync::<Handle>();
}

#[test]
fn invalid_socket_rejected() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    assert!(handle.add(rookery::INVALID_SOCKET, |_, _| {}).is_err());
}

#[test]
fn duplicate_socket_rejected() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, _remote) = pair();

    handle.add(raw(&local), |_, _| {}).unwrap();
    assert!(handle.add(raw(&local), |_, _| {}).is_err());
}

#[test]
fn add_del_round_trip() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, _remote) = pair();

    assert!(handle.is_empty());
    let id = handle.add(raw(&local), |_, _| {}).unwrap();
    assert_eq!(handle.len(), 1);

    assert!(handle.del(id));
    assert!(handle.is_empty());
    // A stale id is a no-op, and the socket can be monitored again.
    assert!(!handle.del(id));
    handle.add(raw(&local), |_, _| {}).unwrap();
    assert_eq!(handle.len(), 1);
}

#[test]
fn capacity_limit() {
    init();
    let reactor = Reactor::with_capacity(1).unwrap();
    let handle = reactor.handle();
    let (first, _keep_first) = pair();
    let (second, _keep_second) = pair();

    handle.add(raw(&first), |_, _| {}).unwrap();
    let err = handle.add(raw(&second), |_, _| {}).unwrap_err();
    // Arena-full is a try-again condition, not a hard fault.
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    assert!(err.to_string().contains("limit"));
}

#[test]
fn read_mode_gates_dispatch() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, mut remote) = pair();

    let (tx, rx) = mpsc::channel();
    let id = handle
        .add(raw(&local), move |_, kind| {
            if kind == Kind::Read {
                let _ = tx.send(());
            }
        })
        .unwrap();

    let stopper = reactor.handle();
    let runner = thread::spawn(move || {
        reactor.run().unwrap();
    });

    // Data arrives while READ is disabled: nothing may be dispatched.
    remote.write_all(b"x").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    // Enabling READ surfaces the pending bytes.
    assert!(handle.mode(id, Kind::Read, Mode::Enabled));
    rx.recv_timeout(Duration::from_secs(2))
        .expect("no READ event after enabling the mode");

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn stop_leaves_reactor_reusable() {
    init();
    let reactor = Reactor::new().unwrap();

    for _ in 0..2 {
        let stopper = reactor.handle();
        reactor
            .handle()
            .add_timer(Duration::from_millis(10), false, move |id, _| {
                stopper.del(id);
                stopper.stop();
            })
            .unwrap();
        reactor.run().unwrap();
        assert!(!reactor.launched());
        assert!(reactor.handle().is_empty());
    }
}

#[test]
fn stop_from_another_thread() {
    init();
    let reactor = Reactor::new().unwrap();
    let stopper = reactor.handle();

    let waiter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stopper.stop();
    });

    reactor.run().unwrap();
    waiter.join().unwrap();
}

#[test]
fn freeze_pauses_dispatch() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, mut remote) = pair();

    let (tx, rx) = mpsc::channel();
    let id = handle
        .add(raw(&local), move |_, kind| {
            if kind == Kind::Read {
                let _ = tx.send(());
            }
        })
        .unwrap();
    handle.mode(id, Kind::Read, Mode::Enabled);
    handle.freeze(true);

    let stopper = reactor.handle();
    let runner = thread::spawn(move || {
        reactor.run().unwrap();
    });

    remote.write_all(b"x").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    // Thawing plus fresh bytes resumes delivery.
    handle.freeze(false);
    remote.write_all(b"y").unwrap();
    rx.recv_timeout(Duration::from_secs(2))
        .expect("no READ event after thawing");

    stopper.stop();
    runner.join().unwrap();
}
