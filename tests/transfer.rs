#![cfg(unix)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rookery::transfer::{Marks, SocketLink, TimeoutKind, Transfer};
use rookery::Reactor;

mod util;

use util::{init, raw};

fn pump_pair() -> (UnixStream, UnixStream) {
    let (local, remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();
    (local, remote)
}

#[test]
fn echo_round_trip() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, mut remote) = pump_pair();

    let socket = raw(&local);
    let transfer =
        Transfer::new(handle.clone(), socket, Box::new(SocketLink::new(socket, false))).unwrap();

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    transfer.on_read(move |bytes| {
        let _ = tx.send(bytes.to_vec());
    });
    transfer.start();

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    remote.write_all(b"ping").unwrap();
    let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(received, b"ping");

    // And back out through the pump.
    transfer.send(b"pong");
    let mut reply = [0u8; 4];
    remote.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn read_watermark_chops_deliveries() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, mut remote) = pump_pair();

    let socket = raw(&local);
    let transfer =
        Transfer::new(handle.clone(), socket, Box::new(SocketLink::new(socket, false))).unwrap();
    transfer.set_marks(Marks {
        read_max: 4,
        ..Marks::default()
    });

    let (tx, rx) = mpsc::channel::<usize>();
    transfer.on_read(move |bytes| {
        let _ = tx.send(bytes.len());
    });
    transfer.start();

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    remote.write_all(&[7u8; 10]).unwrap();
    let mut total = 0;
    while total < 10 {
        let chunk = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(chunk <= 4, "delivery of {} exceeds read_max", chunk);
        total += chunk;
    }
    assert_eq!(total, 10);

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn write_floor_batches_output() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, mut remote) = pump_pair();
    remote.set_nonblocking(true).unwrap();

    let socket = raw(&local);
    let transfer =
        Transfer::new(handle.clone(), socket, Box::new(SocketLink::new(socket, false))).unwrap();
    transfer.set_marks(Marks {
        write_min: 8,
        ..Marks::default()
    });

    let (tx, rx) = mpsc::channel();
    transfer.on_drain(move || {
        let _ = tx.send(());
    });

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    // Below the floor: nothing goes out, "ready for more" fires instead.
    transfer.send(b"1234");
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let mut probe = [0u8; 16];
    assert!(remote.read(&mut probe).is_err(), "bytes leaked below write_min");
    assert_eq!(transfer.pending(), 4);

    // Reaching the floor releases the whole batch.
    transfer.send(b"5678");
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    thread::sleep(Duration::from_millis(50));
    let n = remote.read(&mut probe).unwrap();
    assert_eq!(&probe[..n], b"12345678");

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn read_timeout_fires_when_idle() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, _remote) = pump_pair();

    let socket = raw(&local);
    let transfer =
        Transfer::new(handle.clone(), socket, Box::new(SocketLink::new(socket, false))).unwrap();

    let (tx, rx) = mpsc::channel();
    transfer.on_timeout(move |kind| {
        let _ = tx.send(kind);
    });
    transfer.set_read_timeout(Duration::from_millis(80)).unwrap();
    transfer.start();

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    let kind = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(kind, TimeoutKind::Read);

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn peer_close_reports_once() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let (local, remote) = pump_pair();

    let socket = raw(&local);
    let transfer =
        Transfer::new(handle.clone(), socket, Box::new(SocketLink::new(socket, false))).unwrap();

    let (tx, rx) = mpsc::channel();
    transfer.on_close(move || {
        let _ = tx.send(());
    });
    transfer.start();

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    drop(remote);
    rx.recv_timeout(Duration::from_secs(2)).expect("no close event");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    stopper.stop();
    runner.join().unwrap();
}
