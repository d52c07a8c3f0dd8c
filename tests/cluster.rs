#![cfg(unix)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rookery::cluster::Cluster;
use rookery::Reactor;

mod util;

use util::init;

/// Scenario: fork two workers over the PIPE transport, observe exactly one
/// HELLO per child, broadcast one payload, and read one echo back from
/// each worker.
///
/// Everything runs in a single test: forking from the multi-threaded test
/// harness more than once at a time is asking for trouble.
#[test]
fn hello_and_broadcast_over_pipe_transport() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();
    let cluster = Arc::new(Cluster::new(handle.clone(), "Rookery"));

    let ready: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let echoed: Arc<Mutex<Vec<(i32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));

    cluster.init(1, 2);
    {
        // Parent: track HELLOs; once both children are up, broadcast.
        let ready = Arc::clone(&ready);
        let broadcaster = Arc::clone(&cluster);
        cluster.on_ready(move |wid, pid| {
            assert_eq!(wid, 1);
            let mut ready = ready.lock().unwrap();
            ready.push(pid);
            if ready.len() == 2 {
                broadcaster.broadcast(1, b"X");
            }
        });
    }
    {
        // Parent: collect echoes and stop once both children answered.
        // (In the children this slot is replaced below.)
        let echoed = Arc::clone(&echoed);
        let stopper = handle.clone();
        cluster.on_message(move |wid, pid, payload| {
            assert_eq!(wid, 1);
            echoed.lock().unwrap().push((pid, payload.to_vec()));
            if echoed.lock().unwrap().len() == 2 {
                stopper.stop();
            }
        });
    }

    cluster.start(1);

    if !cluster.master() {
        // Child: echo whatever arrives back to the parent, and never fall
        // through into the test harness.
        let replier = Arc::clone(&cluster);
        cluster.on_message(move |wid, _, payload| {
            replier.send(wid, payload);
        });
        let bail = handle.clone();
        handle
            .add_timer(Duration::from_secs(10), false, move |_, _| bail.stop())
            .unwrap();
        let _ = reactor.run();
        std::process::exit(0);
    }

    // Parent: a watchdog so a wedged run fails instead of hanging.
    let watchdog = handle.clone();
    handle
        .add_timer(Duration::from_secs(10), false, move |_, _| watchdog.stop())
        .unwrap();
    reactor.run().unwrap();

    let ready = ready.lock().unwrap();
    assert_eq!(ready.len(), 2, "expected one HELLO per child: {:?}", *ready);
    let unique: HashSet<i32> = ready.iter().copied().collect();
    assert_eq!(unique.len(), 2, "duplicate HELLO pids: {:?}", *ready);

    let mut recorded = cluster.pids(1);
    let mut announced: Vec<i32> = ready.clone();
    recorded.sort_unstable();
    announced.sort_unstable();
    assert_eq!(recorded, announced);

    let echoed = echoed.lock().unwrap();
    assert_eq!(echoed.len(), 2, "echoes: {:?}", *echoed);
    for (pid, payload) in echoed.iter() {
        assert!(unique.contains(pid));
        assert_eq!(payload, b"X");
    }

    cluster.close();
    assert!(!cluster.working(1));
}

#[test]
fn parent_side_bookkeeping_without_forking() {
    init();
    let reactor = Reactor::new().unwrap();
    let cluster = Cluster::new(reactor.handle(), "NoFork");

    assert!(cluster.master());
    assert!(!cluster.working(9));
    assert!(cluster.pids(9).is_empty());
    assert_eq!(cluster.backlog(9, 1234), 0);

    // Messaging before any fork is a clean no-op.
    assert!(!cluster.send_to(9, 1234, b"nobody"));
    assert!(!cluster.send(9, b"not a child"));
    cluster.broadcast(9, b"nobody home");
}
