use std::sync::{Arc, Mutex};

use rookery::http2::{ErrorCode, Flag, FrameKind, Session, SessionMode, Setting};

mod util;

use util::init;

type Wire = Arc<Mutex<Vec<u8>>>;

fn session(mode: SessionMode, settings: &[(Setting, u32)]) -> (Session, Wire) {
    let mut session = Session::new();
    let wire: Wire = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&wire);
    session.callbacks.send = Some(Box::new(move |bytes| {
        out.lock().unwrap().extend_from_slice(bytes);
    }));
    session.init(mode, settings).unwrap();
    (session, wire)
}

/// Ferry bytes both ways until neither side has anything in flight.
fn shuttle(client: &mut Session, client_wire: &Wire, server: &mut Session, server_wire: &Wire) {
    loop {
        let to_server: Vec<u8> = std::mem::take(&mut client_wire.lock().unwrap());
        if !to_server.is_empty() {
            server.frame(&to_server).unwrap();
        }
        let to_client: Vec<u8> = std::mem::take(&mut server_wire.lock().unwrap());
        if !to_client.is_empty() {
            client.frame(&to_client).unwrap();
        }
        if client_wire.lock().unwrap().is_empty() && server_wire.lock().unwrap().is_empty() {
            return;
        }
    }
}

fn request_headers() -> Vec<(String, String)> {
    vec![
        (":method".into(), "POST".into()),
        (":path".into(), "/echo".into()),
        (":scheme".into(), "https".into()),
        (":authority".into(), "example.com".into()),
    ]
}

#[test]
fn echo_round_trip() {
    init();
    let (mut client, client_wire) = session(SessionMode::Client, &[]);
    let (mut server, server_wire) = session(
        SessionMode::Server,
        &[
            (Setting::Streams, 100),
            (Setting::WindowSize, 65_535),
            (Setting::FrameSize, 16_384),
        ],
    );

    let begun = Arc::new(Mutex::new(Vec::new()));
    let headers = Arc::new(Mutex::new(Vec::new()));
    let body = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(Vec::new()));
    {
        let begun = Arc::clone(&begun);
        server.callbacks.begin = Some(Box::new(move |sid| begun.lock().unwrap().push(sid)));
        let headers = Arc::clone(&headers);
        server.callbacks.header = Some(Box::new(move |sid, name, value| {
            headers
                .lock()
                .unwrap()
                .push((sid, name.to_owned(), value.to_owned()));
        }));
        let body = Arc::clone(&body);
        server.callbacks.chunk = Some(Box::new(move |_, bytes| {
            body.lock().unwrap().extend_from_slice(bytes);
        }));
        let closed = Arc::clone(&closed);
        server.callbacks.close =
            Some(Box::new(move |sid, code| closed.lock().unwrap().push((sid, code))));
    }

    let reply_body = Arc::new(Mutex::new(Vec::new()));
    let reply_status = Arc::new(Mutex::new(Vec::new()));
    let client_closed = Arc::new(Mutex::new(Vec::new()));
    {
        let reply_body = Arc::clone(&reply_body);
        client.callbacks.chunk = Some(Box::new(move |_, bytes| {
            reply_body.lock().unwrap().extend_from_slice(bytes);
        }));
        let reply_status = Arc::clone(&reply_status);
        client.callbacks.header = Some(Box::new(move |sid, name, value| {
            reply_status
                .lock()
                .unwrap()
                .push((sid, name.to_owned(), value.to_owned()));
        }));
        let client_closed = Arc::clone(&client_closed);
        client.callbacks.close =
            Some(Box::new(move |sid, code| client_closed.lock().unwrap().push((sid, code))));
    }

    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    let sid = client
        .send_headers(None, &request_headers(), Flag::None)
        .unwrap();
    assert_eq!(sid, 1);
    client.send_data(sid, b"hello", Flag::EndStream).unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    assert_eq!(*begun.lock().unwrap(), vec![1]);
    assert_eq!(&*body.lock().unwrap(), b"hello");
    let seen = headers.lock().unwrap();
    assert!(seen.contains(&(1, ":method".into(), "POST".into())));
    assert!(seen.contains(&(1, ":path".into(), "/echo".into())));
    drop(seen);

    // Echo back.
    server
        .send_headers(Some(1), &[(":status".into(), "200".into())], Flag::None)
        .unwrap();
    server.send_data(1, b"hello", Flag::EndStream).unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    assert_eq!(&*reply_body.lock().unwrap(), b"hello");
    assert!(reply_status
        .lock()
        .unwrap()
        .contains(&(1, ":status".into(), "200".into())));
    assert_eq!(*closed.lock().unwrap(), vec![(1, ErrorCode::None)]);
    assert_eq!(*client_closed.lock().unwrap(), vec![(1, ErrorCode::None)]);
}

#[test]
fn flow_control_gates_data() {
    init();
    // The client only grants a 32-byte stream window.
    let (mut client, client_wire) = session(SessionMode::Client, &[(Setting::WindowSize, 32)]);
    let (mut server, server_wire) = session(SessionMode::Server, &[]);

    let frames = Arc::new(Mutex::new(Vec::new()));
    {
        let frames = Arc::clone(&frames);
        server.callbacks.frame_sent = Some(Box::new(move |sid, kind, flags| {
            if kind == FrameKind::Data {
                frames.lock().unwrap().push((sid, flags));
            }
        }));
    }
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        client.callbacks.chunk = Some(Box::new(move |_, bytes| {
            received.lock().unwrap().push(bytes.to_vec());
        }));
    }

    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    let sid = client
        .send_headers(None, &request_headers(), Flag::EndStream)
        .unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    // A 100-byte response against a 32-byte window.
    let payload: Vec<u8> = (0u8..100).collect();
    server
        .send_headers(Some(sid), &[(":status".into(), "200".into())], Flag::None)
        .unwrap();
    server.send_data(sid, &payload, Flag::EndStream).unwrap();

    // Only the first 32 bytes may be in flight.
    assert_eq!(server.backlog(sid), 68);
    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    assert_eq!(received.lock().unwrap().concat().len(), 32);

    // Each replenishment releases the next chunk.
    client.window_update(sid, 32).unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    assert_eq!(received.lock().unwrap().concat().len(), 64);

    client.window_update(sid, 100).unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    let bytes = received.lock().unwrap().concat();
    assert_eq!(bytes, payload);
    assert_eq!(server.backlog(sid), 0);

    // END_STREAM travelled on the final DATA frame only.
    let frames = frames.lock().unwrap();
    let (last, before) = frames.split_last().unwrap();
    assert_eq!(last.1 & 0x1, 0x1);
    for frame in before {
        assert_eq!(frame.1 & 0x1, 0, "END_STREAM on a non-final chunk");
    }
}

#[test]
fn ping_is_acknowledged() {
    init();
    let (mut client, client_wire) = session(SessionMode::Client, &[]);
    let (mut server, server_wire) = session(SessionMode::Server, &[]);

    let acks = Arc::new(Mutex::new(0));
    {
        let acks = Arc::clone(&acks);
        client.callbacks.frame_recv = Some(Box::new(move |_, kind, flags| {
            if kind == FrameKind::Ping && flags & 0x1 != 0 {
                *acks.lock().unwrap() += 1;
            }
        }));
    }

    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    client.ping().unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    assert_eq!(*acks.lock().unwrap(), 1);
}

#[test]
fn reject_resets_the_stream() {
    init();
    let (mut client, client_wire) = session(SessionMode::Client, &[]);
    let (mut server, server_wire) = session(SessionMode::Server, &[]);

    let closed = Arc::new(Mutex::new(Vec::new()));
    {
        let closed = Arc::clone(&closed);
        client.callbacks.close =
            Some(Box::new(move |sid, code| closed.lock().unwrap().push((sid, code))));
    }

    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    let sid = client
        .send_headers(None, &request_headers(), Flag::None)
        .unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    server.reject(sid, ErrorCode::Cancel).unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    assert_eq!(*closed.lock().unwrap(), vec![(sid, ErrorCode::Cancel)]);
}

#[test]
fn trailers_end_the_stream() {
    init();
    let (mut client, client_wire) = session(SessionMode::Client, &[]);
    let (mut server, server_wire) = session(SessionMode::Server, &[]);

    let closed = Arc::new(Mutex::new(Vec::new()));
    let fields = Arc::new(Mutex::new(Vec::new()));
    {
        let closed = Arc::clone(&closed);
        server.callbacks.close =
            Some(Box::new(move |sid, code| closed.lock().unwrap().push((sid, code))));
        let fields = Arc::clone(&fields);
        server.callbacks.header = Some(Box::new(move |_, name, value| {
            fields.lock().unwrap().push((name.to_owned(), value.to_owned()));
        }));
    }

    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    let sid = client
        .send_headers(None, &request_headers(), Flag::None)
        .unwrap();
    client.send_data(sid, b"payload", Flag::None).unwrap();
    client
        .send_trailers(sid, &[("grpc-status".into(), "0".into())])
        .unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    assert!(fields
        .lock()
        .unwrap()
        .contains(&("grpc-status".into(), "0".into())));
    // Client finished its side; the stream half-closed, not closed.
    assert!(closed.lock().unwrap().is_empty());

    server
        .send_headers(Some(sid), &[(":status".into(), "200".into())], Flag::EndStream)
        .unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    assert_eq!(*closed.lock().unwrap(), vec![(sid, ErrorCode::None)]);
}

#[test]
fn empty_origin_list_is_rejected_without_frames() {
    init();
    let (mut server, wire) = session(SessionMode::Server, &[(Setting::EnableOrigin, 1)]);
    wire.lock().unwrap().clear();

    assert!(server.send_origin().is_err());
    assert!(wire.lock().unwrap().is_empty(), "ORIGIN emitted frames");

    server.origin(vec!["https://example.com".into()]);
    server.send_origin().unwrap();
    assert!(!wire.lock().unwrap().is_empty());
}

#[test]
fn origin_frames_reach_the_peer() {
    init();
    let (mut client, client_wire) = session(SessionMode::Client, &[(Setting::EnableOrigin, 1)]);
    let (mut server, server_wire) = session(SessionMode::Server, &[(Setting::EnableOrigin, 1)]);

    let origins = Arc::new(Mutex::new(Vec::new()));
    {
        let origins = Arc::clone(&origins);
        client.callbacks.origin = Some(Box::new(move |origin| {
            origins.lock().unwrap().push(origin.to_owned());
        }));
    }

    shuttle(&mut client, &client_wire, &mut server, &server_wire);
    server.origin(vec![
        "https://example.com".into(),
        "https://alt.example.com".into(),
    ]);
    server.send_origin().unwrap();
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    assert_eq!(
        *origins.lock().unwrap(),
        vec![
            "https://example.com".to_owned(),
            "https://alt.example.com".to_owned(),
        ]
    );
}

#[test]
fn peer_header_table_cap_is_honoured() {
    init();
    let (mut client, client_wire) = session(SessionMode::Client, &[]);
    // The server refuses any dynamic indexing towards it.
    let (mut server, server_wire) =
        session(SessionMode::Server, &[(Setting::HeaderTableSize, 0)]);

    let fields = Arc::new(Mutex::new(Vec::new()));
    {
        let fields = Arc::clone(&fields);
        server.callbacks.header = Some(Box::new(move |_, name, value| {
            fields
                .lock()
                .unwrap()
                .push((name.to_owned(), value.to_owned()));
        }));
    }

    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    // Repeated identical requests keep decoding cleanly: the client's
    // encoder must stop referencing a table the server no longer keeps.
    for _ in 0..3 {
        let sid = client
            .send_headers(None, &request_headers(), Flag::EndStream)
            .unwrap();
        shuttle(&mut client, &client_wire, &mut server, &server_wire);
        server
            .send_headers(Some(sid), &[(":status".into(), "200".into())], Flag::EndStream)
            .unwrap();
        shuttle(&mut client, &client_wire, &mut server, &server_wire);
    }

    let fields = fields.lock().unwrap();
    let authorities = fields
        .iter()
        .filter(|(name, value)| name == ":authority" && value == "example.com")
        .count();
    assert_eq!(authorities, 3);
}

#[test]
fn malformed_preface_kills_the_session() {
    init();
    let (mut server, _wire) = session(SessionMode::Server, &[]);

    let closed = Arc::new(Mutex::new(Vec::new()));
    {
        let closed = Arc::clone(&closed);
        server.callbacks.close =
            Some(Box::new(move |sid, code| closed.lock().unwrap().push((sid, code))));
    }

    assert!(server.frame(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").is_err());
    assert_eq!(*closed.lock().unwrap(), vec![(0, ErrorCode::Protocol)]);
    assert!(!server.is_active());
}

#[test]
fn close_during_event_is_deferred() {
    init();
    let (mut client, client_wire) = session(SessionMode::Client, &[]);
    let (mut server, server_wire) = session(SessionMode::Server, &[]);
    shuttle(&mut client, &client_wire, &mut server, &server_wire);

    // GOAWAY terminates the peer only after the receive event completes;
    // the session is still active while the trigger machinery runs.
    let fired = Arc::new(Mutex::new(false));
    {
        let fired = Arc::clone(&fired);
        client.on_idle(move || {
            *fired.lock().unwrap() = true;
        });
    }
    assert!(*fired.lock().unwrap(), "idle trigger with no event in progress");

    server.shutdown().unwrap();
    server.goaway(0, ErrorCode::EnhanceYourCalm, b"calm down").unwrap();
    let to_client: Vec<u8> = std::mem::take(&mut server_wire.lock().unwrap());
    client.frame(&to_client).unwrap();
    assert!(!client.is_active(), "deferred close never ran");
}
