use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use rookery::client::{Client, Resolver, Scheme, SocketKind, Status};
use rookery::net::Family;
use rookery::Reactor;

mod util;

use util::init;

/// A resolver that never answers by itself; the test plays DNS and feeds
/// results back through `Client::resolved`.
struct ScriptedResolver {
    requests: mpsc::Sender<u64>,
    next: AtomicU64,
    blacklisted: Arc<Mutex<Vec<String>>>,
}

impl Resolver for ScriptedResolver {
    fn resolve(&mut self, _domain: &str, _family: Family) -> u64 {
        let request = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.requests.send(request);
        request
    }

    fn cancel(&mut self, _request: u64) {}

    fn blacklist(&mut self, _family: Family, ip: &str) {
        self.blacklisted.lock().unwrap().push(ip.to_owned());
    }

    fn flush(&mut self) {}
}

#[test]
fn reconnect_after_dns_failure_then_disconnect() {
    init();
    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let (requests_tx, requests_rx) = mpsc::channel();
    let resolver = ScriptedResolver {
        requests: requests_tx,
        next: AtomicU64::new(0),
        blacklisted: Arc::new(Mutex::new(Vec::new())),
    };

    let mut scheme = Scheme::new(
        "http://unresolvable.test:80".into(),
        "unresolvable.test".into(),
        80,
        Family::V4,
        SocketKind::Tcp,
    );
    scheme.alive = true;
    scheme.attempts = 3;

    let client = Client::new(handle.clone(), Arc::new(scheme), Box::new(resolver));
    client.set_reconnect_delay(Duration::from_millis(50));

    let (connected_tx, connected_rx) = mpsc::channel();
    client.on_connect(move || {
        let _ = connected_tx.send(());
    });
    let (gone_tx, gone_rx) = mpsc::channel();
    client.on_disconnect(move || {
        let _ = gone_tx.send(());
    });

    assert!(client.connect());

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    // Play an empty-answer DNS for the initial attempt and every retry.
    let mut resolutions = 0;
    loop {
        match requests_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(request) => {
                resolutions += 1;
                client.resolved(request, "", Family::V4);
            }
            Err(_) => break,
        }
        if gone_rx.try_recv().is_ok() {
            break;
        }
    }
    gone_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("no disconnect after exhausting attempts");

    // Initial attempt plus three reconnects, no connect event.
    assert_eq!(resolutions, 4, "unexpected resolution count");
    assert!(connected_rx.try_recv().is_err());
    assert_eq!(client.scheme().status(), Status::Disconnect);

    stopper.stop();
    runner.join().unwrap();
}

#[test]
fn connects_and_sends_to_a_live_listener() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let reactor = Reactor::new().unwrap();
    let handle = reactor.handle();

    let (requests_tx, _requests_rx) = mpsc::channel();
    let resolver = ScriptedResolver {
        requests: requests_tx,
        next: AtomicU64::new(0),
        blacklisted: Arc::new(Mutex::new(Vec::new())),
    };

    // A literal IP host never touches the resolver.
    let scheme = Scheme::new(
        format!("http://127.0.0.1:{}", port),
        "127.0.0.1".into(),
        port,
        Family::V4,
        SocketKind::Tcp,
    );
    let client = Client::new(handle.clone(), Arc::new(scheme), Box::new(resolver));

    let (connected_tx, connected_rx) = mpsc::channel();
    client.on_connect(move || {
        let _ = connected_tx.send(());
    });

    assert!(client.connect());
    // The per-scheme guard refuses a second attempt in flight.
    assert!(!client.connect());

    let stopper = reactor.handle();
    let runner = thread::spawn(move || reactor.run().unwrap());

    let (mut accepted, _) = listener.accept().unwrap();
    connected_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("no connect event");
    assert_eq!(client.scheme().status(), Status::Connect);

    assert!(client.send(b"hello"));
    let mut buf = [0u8; 5];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    client.close();
    assert_eq!(client.scheme().status(), Status::Disconnect);

    stopper.stop();
    runner.join().unwrap();
}
