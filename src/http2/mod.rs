//! Frame-level HTTP/2 protocol engine.
//!
//! [`Session`] is a complete sans-io state machine: wire bytes go in
//! through [`Session::frame`], emitted frames come out through the `send`
//! callback, and everything in between — SETTINGS negotiation, HPACK
//! coding, stream lifecycle, flow-control windows, and the ALTSVC/ORIGIN
//! extension frames — is handled internally. The engine is single-owner
//! and does no locking; wire it to one connection's transfer pump.
//!
//! Every entry point runs under an event-in-progress guard: while a
//! submit/commit pair executes, a requested close is deferred until the
//! step completes, and an optional one-shot trigger fires once the engine
//! returns to idle.

mod error;
mod frame;
mod hpack;
mod huffman;
mod settings;
mod stream;

pub use self::error::{ErrorCode, Http2Error, Severity};
pub use self::frame::FrameKind;
pub use self::settings::Setting;
pub use self::stream::{Flag, StreamState};

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use log::{trace, warn};

use self::frame::{FrameHeader, HEADER_LEN, PREFACE};
use self::settings::Settings;
use self::stream::Stream;

/// Which side of the connection this session speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Client,
    Server,
}

/// The operation currently holding the engine, mirrored to the deferred
/// close machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RecvFrame,
    SendPing,
    SendShutdown,
    SendReject,
    SendOrigin,
    SendAltSvc,
    SendTrailers,
    SendData,
    SendPush,
    SendHeaders,
    SendGoaway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Idle,
    InEvent(EventKind),
}

/// Callback registry. Unregistered slots fall back to logging at the
/// event's severity.
#[derive(Default)]
pub struct Callbacks {
    /// Wire bytes ready to be written to the peer.
    pub send: Option<Box<dyn FnMut(&[u8]) + Send>>,
    /// A stream left idle (headers begun in either direction).
    pub begin: Option<Box<dyn FnMut(u32) + Send>>,
    /// A stream (or, with id 0, the session) closed with the mapped code.
    pub close: Option<Box<dyn FnMut(u32, ErrorCode) + Send>>,
    /// One DATA chunk arrived.
    pub chunk: Option<Box<dyn FnMut(u32, &[u8]) + Send>>,
    /// One decoded header field arrived.
    pub header: Option<Box<dyn FnMut(u32, &str, &str) + Send>>,
    /// A complete frame arrived.
    pub frame_recv: Option<Box<dyn FnMut(u32, FrameKind, u8) + Send>>,
    /// A frame was created for sending.
    pub frame_sent: Option<Box<dyn FnMut(u32, FrameKind, u8) + Send>>,
    /// An ORIGIN entry arrived.
    pub origin: Option<Box<dyn FnMut(&str) + Send>>,
    /// An ALTSVC entry arrived.
    pub altsvc: Option<Box<dyn FnMut(u32, &str, &str) + Send>>,
    /// Fault reporting: severity, typed error.
    pub error: Option<Box<dyn FnMut(Severity, &Http2Error) + Send>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("send", &self.send.is_some())
            .field("close", &self.close.is_some())
            .field("chunk", &self.chunk.is_some())
            .finish()
    }
}

/// Header-block assembly across HEADERS/PUSH_PROMISE + CONTINUATION.
#[derive(Debug)]
struct Continuation {
    stream: u32,
    /// Promised stream id when assembling a PUSH_PROMISE block.
    promised: Option<u32>,
    end_stream: bool,
    fragment: BytesMut,
}

/// A frame-level HTTP/2 session; see the [module docs](self).
pub struct Session {
    mode: SessionMode,
    active: bool,
    event: EventState,
    pending_close: bool,
    trigger: Option<Box<dyn FnMut() + Send>>,

    /// Callback registry; fill in the slots you need.
    pub callbacks: Callbacks,

    local: Settings,
    remote: Settings,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,

    /// Unparsed wire bytes.
    input: BytesMut,
    /// Emitted frames awaiting the `send` callback.
    wire: BytesMut,
    awaiting_preface: bool,
    continuation: Option<Continuation>,

    streams: BTreeMap<u32, Stream>,
    send_window: i64,
    recv_window: i64,
    next_stream: u32,
    last_peer_stream: u32,
    goaway_sent: bool,
    goaway_recv: bool,
    ping_counter: u64,

    origins: Vec<String>,
    altsvc: Vec<(String, String)>,
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

impl Session {
    /// An inert session; call [`init`](Session::init) before use.
    pub fn new() -> Session {
        Session {
            mode: SessionMode::Client,
            active: false,
            event: EventState::Idle,
            pending_close: false,
            trigger: None,
            callbacks: Callbacks::default(),
            local: Settings::default(),
            remote: Settings::default(),
            encoder: hpack::Encoder::new(4096),
            decoder: hpack::Decoder::new(4096),
            input: BytesMut::new(),
            wire: BytesMut::new(),
            awaiting_preface: false,
            continuation: None,
            streams: BTreeMap::new(),
            send_window: i64::from(settings::DEFAULT_WINDOW_SIZE),
            recv_window: i64::from(settings::DEFAULT_WINDOW_SIZE),
            next_stream: 1,
            last_peer_stream: 0,
            goaway_sent: false,
            goaway_recv: false,
            ping_counter: 0,
            origins: Vec::new(),
            altsvc: Vec::new(),
        }
    }

    /// (Re-)initialize the session and emit the connection preamble.
    ///
    /// Clients write the connection preface followed by their SETTINGS;
    /// servers write SETTINGS and start expecting the peer's preface.
    /// Refused while another event is in progress.
    pub fn init(
        &mut self,
        mode: SessionMode,
        settings: &[(Setting, u32)],
    ) -> Result<(), Http2Error> {
        if self.event != EventState::Idle {
            return Err(Http2Error::Busy);
        }

        let mut local = Settings::default();
        for &(setting, value) in settings {
            local.apply(setting, value)?;
        }

        let callbacks = std::mem::take(&mut self.callbacks);
        let origins = std::mem::take(&mut self.origins);
        let altsvc = std::mem::take(&mut self.altsvc);
        *self = Session::new();
        self.callbacks = callbacks;
        self.origins = origins;
        self.altsvc = altsvc;

        self.mode = mode;
        self.local = local;
        self.active = true;
        self.awaiting_preface = mode == SessionMode::Server;
        self.next_stream = match mode {
            SessionMode::Client => 1,
            SessionMode::Server => 2,
        };
        self.decoder = hpack::Decoder::new(self.local.header_table_size as usize);
        // The peer's table caps our encoder; until its SETTINGS arrive,
        // stay within the protocol default.
        self.encoder = hpack::Encoder::new(4096);
        self.recv_window = i64::from(settings::DEFAULT_WINDOW_SIZE);

        if mode == SessionMode::Client {
            self.wire.extend_from_slice(PREFACE);
        }
        let mut payload = BytesMut::new();
        self.local.encode_payload(&mut payload);
        self.emit(FrameKind::Settings, 0, 0, &payload);

        // Raise the connection-level receive window if asked for more than
        // the default.
        if self.local.window_size > settings::DEFAULT_WINDOW_SIZE {
            let delta = self.local.window_size - settings::DEFAULT_WINDOW_SIZE;
            let mut buf = BytesMut::new();
            buf.put_u32(delta);
            self.emit(FrameKind::WindowUpdate, 0, 0, &buf);
            self.recv_window += i64::from(delta);
        }

        self.flush_wire();
        trace!("http2 session initialized as {:?}", mode);
        Ok(())
    }

    /// Whether the session is initialized and not yet closed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Register the one-shot trigger fired the next time no event is in
    /// progress; fires immediately when already idle.
    pub fn on_idle<F>(&mut self, trigger: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.event == EventState::Idle {
            let mut trigger = trigger;
            trigger();
        } else {
            self.trigger = Some(Box::new(trigger));
        }
    }

    /// Configure the ORIGIN list for [`send_origin`](Session::send_origin).
    pub fn origin(&mut self, origins: Vec<String>) {
        self.origins = origins;
    }

    /// Configure the ALTSVC entries for
    /// [`send_altsvc`](Session::send_altsvc); `(origin, alternative)`
    /// pairs, duplicates allowed.
    pub fn altsvc(&mut self, entries: Vec<(String, String)>) {
        self.altsvc = entries;
    }

    /// Outbound capacity for one stream: whatever fits both the session
    /// and stream send windows.
    pub fn available(&self, stream: u32) -> usize {
        let stream_window = match self.streams.get(&stream) {
            Some(stream) => stream.send_window,
            None => return 0,
        };
        self.send_window.min(stream_window).max(0) as usize
    }

    /// Unsent payload bytes queued behind flow control on one stream.
    pub fn backlog(&self, stream: u32) -> usize {
        self.streams
            .get(&stream)
            .map(|stream| stream.backlog())
            .unwrap_or(0)
    }

    /// Terminate the session, or defer until the in-progress event
    /// completes.
    pub fn close(&mut self) {
        if self.event != EventState::Idle {
            self.pending_close = true;
            return;
        }
        self.terminate_quiet();
    }

    // ===== receive path =====

    /// Feed received wire bytes; embedded callbacks run synchronously, in
    /// wire order.
    pub fn frame(&mut self, bytes: &[u8]) -> Result<(), Http2Error> {
        if !self.active {
            return Err(Http2Error::NotInitialized);
        }
        self.with_event(EventKind::RecvFrame, |session| {
            session.input.extend_from_slice(bytes);
            session.process_input()
        })
    }

    fn process_input(&mut self) -> Result<(), Http2Error> {
        if self.awaiting_preface {
            if self.input.len() < PREFACE.len() {
                if !PREFACE.starts_with(&self.input[..]) {
                    return Err(self.connection_error(
                        ErrorCode::Protocol,
                        "malformed connection preface",
                    ));
                }
                return Ok(());
            }
            if &self.input[..PREFACE.len()] != PREFACE {
                return Err(
                    self.connection_error(ErrorCode::Protocol, "malformed connection preface")
                );
            }
            self.input.advance(PREFACE.len());
            self.awaiting_preface = false;
        }

        loop {
            if self.input.len() < HEADER_LEN {
                return Ok(());
            }
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&self.input[..HEADER_LEN]);
            let header = FrameHeader::parse(&raw);

            if header.length > self.local.frame_size {
                return Err(
                    self.connection_error(ErrorCode::FrameSize, "frame exceeds SETTINGS limit")
                );
            }
            let total = HEADER_LEN + header.length as usize;
            if self.input.len() < total {
                return Ok(());
            }
            self.input.advance(HEADER_LEN);
            let payload = self.input.split_to(header.length as usize);

            self.handle_frame(header, &payload)?;
            if !self.active {
                return Ok(());
            }
        }
    }

    fn handle_frame(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        trace!(
            "recv {:?} stream={} flags={:#x} len={}",
            header.kind,
            header.stream,
            header.flags,
            header.length
        );

        // A started header block admits only its own CONTINUATIONs.
        if self.continuation.is_some() && header.kind != FrameKind::Continuation {
            return Err(
                self.connection_error(ErrorCode::Protocol, "frame interleaved in header block")
            );
        }

        if let Some(cb) = self.callbacks.frame_recv.as_mut() {
            cb(header.stream, header.kind, header.flags);
        }

        match header.kind {
            FrameKind::Data => self.recv_data(header, payload),
            FrameKind::Headers => self.recv_headers(header, payload),
            FrameKind::Continuation => self.recv_continuation(header, payload),
            FrameKind::Priority => self.recv_priority(header, payload),
            FrameKind::RstStream => self.recv_rst_stream(header, payload),
            FrameKind::Settings => self.recv_settings(header, payload),
            FrameKind::PushPromise => self.recv_push_promise(header, payload),
            FrameKind::Ping => self.recv_ping(header, payload),
            FrameKind::Goaway => self.recv_goaway(header, payload),
            FrameKind::WindowUpdate => self.recv_window_update(header, payload),
            FrameKind::AltSvc => self.recv_altsvc(header, payload),
            FrameKind::Origin => self.recv_origin(header, payload),
            // Extension frames without engine semantics are skipped.
            FrameKind::PriorityUpdate | FrameKind::Unknown(_) => Ok(()),
        }
    }

    fn recv_data(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream == 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "DATA on stream 0"));
        }

        // Flow control charges the whole payload, padding included.
        self.recv_window -= i64::from(header.length);
        if self.recv_window < 0 {
            return Err(
                self.connection_error(ErrorCode::FlowControl, "connection window exhausted")
            );
        }

        let data = match strip_padding(header, payload) {
            Some(data) => data,
            None => {
                return Err(self.connection_error(ErrorCode::Protocol, "bad DATA padding"));
            }
        };

        enum Verdict {
            Deliver,
            StreamOverflow,
            Unknown,
        }
        let verdict = match self.streams.get_mut(&header.stream) {
            Some(stream) if !stream.is_recv_closed() => {
                stream.recv_window -= i64::from(header.length);
                if stream.recv_window < 0 {
                    Verdict::StreamOverflow
                } else {
                    Verdict::Deliver
                }
            }
            _ => Verdict::Unknown,
        };
        match verdict {
            Verdict::Deliver => {}
            Verdict::StreamOverflow => {
                self.reset_stream(header.stream, ErrorCode::FlowControl, "stream window");
                return Ok(());
            }
            Verdict::Unknown => {
                self.reset_stream(header.stream, ErrorCode::StreamClosed, "DATA on closed stream");
                return Ok(());
            }
        }

        if !data.is_empty() {
            if let Some(cb) = self.callbacks.chunk.as_mut() {
                cb(header.stream, data);
            }
        }
        if header.has_flag(frame::FLAG_END_STREAM) {
            self.peer_finished(header.stream);
        }
        Ok(())
    }

    fn recv_headers(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream == 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "HEADERS on stream 0"));
        }

        let mut body = match strip_padding(header, payload) {
            Some(body) => body,
            None => {
                return Err(self.connection_error(ErrorCode::Protocol, "bad HEADERS padding"));
            }
        };
        if header.has_flag(frame::FLAG_PRIORITY) {
            if body.len() < 5 {
                return Err(
                    self.connection_error(ErrorCode::FrameSize, "short priority section")
                );
            }
            body = &body[5..];
        }

        // A new peer-initiated stream, or headers/trailers on a known one.
        if self.streams.get(&header.stream).is_none() {
            let peer_initiated = match self.mode {
                SessionMode::Server => header.stream % 2 == 1,
                SessionMode::Client => false,
            };
            if !peer_initiated || header.stream <= self.last_peer_stream {
                return Err(
                    self.connection_error(ErrorCode::Protocol, "HEADERS on unexpected stream")
                );
            }
            if let Some(max) = self.local.max_streams {
                let open = self
                    .streams
                    .values()
                    .filter(|stream| !matches!(stream.state, StreamState::Closed))
                    .count();
                if open as u32 >= max {
                    self.reset_stream(header.stream, ErrorCode::RefusedStream, "stream limit");
                    return Ok(());
                }
            }
            self.last_peer_stream = header.stream;
            let mut stream = Stream::new(self.remote.window_size, self.local.window_size);
            stream.state = StreamState::Open;
            self.streams.insert(header.stream, stream);
            if let Some(cb) = self.callbacks.begin.as_mut() {
                cb(header.stream);
            }
        }

        let continuation = Continuation {
            stream: header.stream,
            promised: None,
            end_stream: header.has_flag(frame::FLAG_END_STREAM),
            fragment: BytesMut::from(body),
        };
        if header.has_flag(frame::FLAG_END_HEADERS) {
            self.finish_header_block(continuation)
        } else {
            self.continuation = Some(continuation);
            Ok(())
        }
    }

    fn recv_continuation(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        let mut continuation = match self.continuation.take() {
            Some(continuation) if continuation.stream == header.stream => continuation,
            _ => {
                return Err(
                    self.connection_error(ErrorCode::Protocol, "unexpected CONTINUATION")
                );
            }
        };
        continuation.fragment.extend_from_slice(payload);
        if header.has_flag(frame::FLAG_END_HEADERS) {
            self.finish_header_block(continuation)
        } else {
            self.continuation = Some(continuation);
            Ok(())
        }
    }

    fn finish_header_block(&mut self, continuation: Continuation) -> Result<(), Http2Error> {
        let target = continuation.promised.unwrap_or(continuation.stream);
        let fragment = continuation.fragment.freeze();

        let callbacks = &mut self.callbacks;
        let decoded = self.decoder.decode_block(&fragment, |name, value| {
            if let Some(cb) = callbacks.header.as_mut() {
                cb(target, name, value);
            }
        });
        if let Err(err) = decoded {
            let report = self.connection_error(err.code(), "header block failed to decode");
            return Err(report);
        }

        if continuation.end_stream {
            self.peer_finished(continuation.stream);
        }
        Ok(())
    }

    fn recv_priority(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream == 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "PRIORITY on stream 0"));
        }
        if payload.len() != 5 {
            self.reset_stream(header.stream, ErrorCode::FrameSize, "bad PRIORITY length");
        }
        // The priority tree itself is advisory; surfacing the frame through
        // the frame callback is all the engine does with it.
        Ok(())
    }

    fn recv_rst_stream(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream == 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "RST_STREAM on stream 0"));
        }
        if payload.len() != 4 {
            return Err(self.connection_error(ErrorCode::FrameSize, "bad RST_STREAM length"));
        }
        let code = ErrorCode::from_wire(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]));
        self.close_stream(header.stream, code);
        Ok(())
    }

    fn recv_settings(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream != 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "SETTINGS on a stream"));
        }
        if header.has_flag(frame::FLAG_ACK) {
            if !payload.is_empty() {
                return Err(
                    self.connection_error(ErrorCode::FrameSize, "SETTINGS ack with payload")
                );
            }
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            return Err(self.connection_error(ErrorCode::FrameSize, "bad SETTINGS length"));
        }

        for entry in payload.chunks(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                settings::ID_HEADER_TABLE_SIZE => {
                    self.remote.header_table_size = value;
                    // Cap the encoder's dynamic table; the owed size
                    // update goes out with the next header block.
                    self.encoder.set_limit(value as usize);
                }
                settings::ID_ENABLE_PUSH => match value {
                    0 => self.remote.enable_push = false,
                    1 => self.remote.enable_push = true,
                    _ => {
                        return Err(
                            self.connection_error(ErrorCode::Protocol, "bad ENABLE_PUSH value")
                        );
                    }
                },
                settings::ID_MAX_CONCURRENT_STREAMS => {
                    self.remote.max_streams = Some(value);
                }
                settings::ID_INITIAL_WINDOW_SIZE => {
                    if value > settings::MAX_WINDOW_SIZE {
                        return Err(self.connection_error(
                            ErrorCode::FlowControl,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    // The delta applies to every open stream's send window
                    // (RFC 9113 §6.9.2).
                    let delta = i64::from(value) - i64::from(self.remote.window_size);
                    self.remote.window_size = value;
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                settings::ID_MAX_FRAME_SIZE => {
                    if !(settings::DEFAULT_FRAME_SIZE..=settings::MAX_FRAME_SIZE)
                        .contains(&value)
                    {
                        return Err(self.connection_error(
                            ErrorCode::Protocol,
                            "MAX_FRAME_SIZE out of range",
                        ));
                    }
                    self.remote.frame_size = value;
                }
                settings::ID_MAX_HEADER_LIST_SIZE => {
                    self.remote.max_header_list = Some(value);
                }
                settings::ID_ENABLE_CONNECT_PROTOCOL => {
                    self.remote.connect = value != 0;
                }
                _ => {}
            }
        }

        self.emit(FrameKind::Settings, frame::FLAG_ACK, 0, &[]);
        // Settings opened send capacity; queued records may fit now.
        self.pump_all_streams();
        Ok(())
    }

    fn recv_push_promise(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if self.mode != SessionMode::Client {
            return Err(self.connection_error(ErrorCode::Protocol, "PUSH_PROMISE to a server"));
        }
        if !self.local.enable_push {
            return Err(self.connection_error(ErrorCode::Protocol, "push is disabled"));
        }
        let body = match strip_padding(header, payload) {
            Some(body) => body,
            None => {
                return Err(
                    self.connection_error(ErrorCode::Protocol, "bad PUSH_PROMISE padding")
                );
            }
        };
        if body.len() < 4 {
            return Err(self.connection_error(ErrorCode::FrameSize, "short PUSH_PROMISE"));
        }
        let promised = u32::from_be_bytes([body[0], body[1], body[2], body[3]])
            & frame::STREAM_ID_MASK;
        if promised == 0 || promised % 2 != 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "bad promised stream id"));
        }

        let mut stream = Stream::new(self.remote.window_size, self.local.window_size);
        // A pushed stream only ever flows server-to-client.
        stream.state = StreamState::HalfClosedLocal;
        self.streams.insert(promised, stream);
        if let Some(cb) = self.callbacks.begin.as_mut() {
            cb(promised);
        }

        let continuation = Continuation {
            stream: header.stream,
            promised: Some(promised),
            end_stream: false,
            fragment: BytesMut::from(&body[4..]),
        };
        if header.has_flag(frame::FLAG_END_HEADERS) {
            self.finish_header_block(continuation)
        } else {
            self.continuation = Some(continuation);
            Ok(())
        }
    }

    fn recv_ping(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream != 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "PING on a stream"));
        }
        if payload.len() != 8 {
            return Err(self.connection_error(ErrorCode::FrameSize, "bad PING length"));
        }
        if !header.has_flag(frame::FLAG_ACK) {
            self.emit(FrameKind::Ping, frame::FLAG_ACK, 0, payload);
        }
        Ok(())
    }

    fn recv_goaway(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if header.stream != 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "GOAWAY on a stream"));
        }
        if payload.len() < 8 {
            return Err(self.connection_error(ErrorCode::FrameSize, "short GOAWAY"));
        }
        let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
            & frame::STREAM_ID_MASK;
        let code = ErrorCode::from_wire(u32::from_be_bytes([
            payload[4], payload[5], payload[6], payload[7],
        ]));
        self.goaway_recv = true;

        // A graceful-shutdown notice (NO_ERROR, maximum stream id) only
        // stops new streams; anything else tears the session down once
        // the current step completes.
        let notice = code == ErrorCode::None && last == frame::STREAM_ID_MASK;
        if !notice {
            if let Some(cb) = self.callbacks.close.as_mut() {
                cb(0, code);
            }
            self.pending_close = true;
        }
        Ok(())
    }

    fn recv_window_update(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if payload.len() != 4 {
            return Err(self.connection_error(ErrorCode::FrameSize, "bad WINDOW_UPDATE length"));
        }
        let delta = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
            & frame::STREAM_ID_MASK;
        if delta == 0 {
            if header.stream == 0 {
                return Err(
                    self.connection_error(ErrorCode::Protocol, "zero WINDOW_UPDATE")
                );
            }
            self.reset_stream(header.stream, ErrorCode::Protocol, "zero WINDOW_UPDATE");
            return Ok(());
        }

        if header.stream == 0 {
            self.send_window += i64::from(delta);
            if self.send_window > i64::from(settings::MAX_WINDOW_SIZE) {
                return Err(
                    self.connection_error(ErrorCode::FlowControl, "connection window overflow")
                );
            }
            // A session-level update may unblock every stream: drain in
            // ascending stream-id order.
            self.pump_all_streams();
        } else if let Some(stream) = self.streams.get_mut(&header.stream) {
            stream.send_window += i64::from(delta);
            if stream.send_window > i64::from(settings::MAX_WINDOW_SIZE) {
                self.reset_stream(header.stream, ErrorCode::FlowControl, "window overflow");
                return Ok(());
            }
            self.pump_stream(header.stream);
        }
        Ok(())
    }

    fn recv_altsvc(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if !self.local.altsvc {
            return Ok(());
        }
        if payload.len() < 2 {
            return Err(self.connection_error(ErrorCode::FrameSize, "short ALTSVC"));
        }
        let origin_len = usize::from(u16::from_be_bytes([payload[0], payload[1]]));
        if payload.len() < 2 + origin_len {
            return Err(self.connection_error(ErrorCode::FrameSize, "short ALTSVC origin"));
        }
        let origin = String::from_utf8_lossy(&payload[2..2 + origin_len]).into_owned();
        let value = String::from_utf8_lossy(&payload[2 + origin_len..]).into_owned();
        if let Some(cb) = self.callbacks.altsvc.as_mut() {
            cb(header.stream, &origin, &value);
        }
        Ok(())
    }

    fn recv_origin(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), Http2Error> {
        if !self.local.origin {
            return Ok(());
        }
        if header.stream != 0 {
            return Err(self.connection_error(ErrorCode::Protocol, "ORIGIN on a stream"));
        }
        let mut rest = payload;
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(self.connection_error(ErrorCode::FrameSize, "short ORIGIN entry"));
            }
            let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
            if rest.len() < 2 + len {
                return Err(self.connection_error(ErrorCode::FrameSize, "short ORIGIN entry"));
            }
            let origin = String::from_utf8_lossy(&rest[2..2 + len]).into_owned();
            if let Some(cb) = self.callbacks.origin.as_mut() {
                cb(&origin);
            }
            rest = &rest[2 + len..];
        }
        Ok(())
    }

    // ===== send path =====

    /// Send a PING with an opaque monotonic payload.
    pub fn ping(&mut self) -> Result<(), Http2Error> {
        if !self.active {
            return Err(Http2Error::NotInitialized);
        }
        self.with_event(EventKind::SendPing, |session| {
            session.ping_counter += 1;
            let payload = session.ping_counter.to_be_bytes();
            session.emit(FrameKind::Ping, 0, 0, &payload);
            Ok(())
        })
    }

    /// Server: announce graceful shutdown (GOAWAY with the maximum stream
    /// id, NO_ERROR), letting in-flight streams finish.
    pub fn shutdown(&mut self) -> Result<(), Http2Error> {
        self.require_server()?;
        self.with_event(EventKind::SendShutdown, |session| {
            session.emit_goaway(frame::STREAM_ID_MASK, ErrorCode::None, &[]);
            Ok(())
        })
    }

    /// Server: terminate the connection, reporting the last processed
    /// stream and an error code, with optional opaque debug data.
    pub fn goaway(
        &mut self,
        last_stream: u32,
        error: ErrorCode,
        debug: &[u8],
    ) -> Result<(), Http2Error> {
        self.require_server()?;
        self.with_event(EventKind::SendGoaway, |session| {
            session.emit_goaway(last_stream, error, debug);
            session.goaway_sent = true;
            Ok(())
        })
    }

    /// Server: reset one stream.
    pub fn reject(&mut self, stream: u32, error: ErrorCode) -> Result<(), Http2Error> {
        self.require_server()?;
        self.with_event(EventKind::SendReject, |session| {
            if !session.streams.contains_key(&stream) {
                return Err(Http2Error::UnknownStream(stream));
            }
            session.reset_stream(stream, error, "rejected by application");
            Ok(())
        })
    }

    /// Send a header block, opening a new stream when `stream` is `None`
    /// (clients only). Returns the stream id used.
    pub fn send_headers(
        &mut self,
        stream: Option<u32>,
        headers: &[(String, String)],
        flag: Flag,
    ) -> Result<u32, Http2Error> {
        if !self.active {
            return Err(Http2Error::NotInitialized);
        }
        self.with_event(EventKind::SendHeaders, |session| {
            let id = match stream {
                Some(id) => {
                    let known = session
                        .streams
                        .get(&id)
                        .map(|stream| !stream.is_send_closed())
                        .unwrap_or(false);
                    if !known {
                        return Err(Http2Error::UnknownStream(id));
                    }
                    id
                }
                None => {
                    if session.mode != SessionMode::Client {
                        return Err(Http2Error::ClientOnly);
                    }
                    if session.goaway_recv {
                        return Err(Http2Error::Closed);
                    }
                    let id = session.next_stream;
                    session.next_stream += 2;
                    let mut opened =
                        Stream::new(session.remote.window_size, session.local.window_size);
                    opened.state = StreamState::Open;
                    session.streams.insert(id, opened);
                    if let Some(cb) = session.callbacks.begin.as_mut() {
                        cb(id);
                    }
                    id
                }
            };

            session.emit_header_block(id, headers, flag == Flag::EndStream);
            if flag == Flag::EndStream {
                session.local_finished(id);
            }
            Ok(id)
        })
    }

    /// Send trailers: a header block that always ends the stream.
    pub fn send_trailers(
        &mut self,
        stream: u32,
        headers: &[(String, String)],
    ) -> Result<(), Http2Error> {
        if !self.active {
            return Err(Http2Error::NotInitialized);
        }
        self.with_event(EventKind::SendTrailers, |session| {
            let known = session
                .streams
                .get(&stream)
                .map(|stream| !stream.is_send_closed())
                .unwrap_or(false);
            if !known {
                return Err(Http2Error::UnknownStream(stream));
            }
            session.emit_header_block(stream, headers, true);
            session.local_finished(stream);
            Ok(())
        })
    }

    /// Server: promise a pushed stream under `parent`. Returns the
    /// promised stream id.
    pub fn send_push(
        &mut self,
        parent: u32,
        headers: &[(String, String)],
        flag: Flag,
    ) -> Result<u32, Http2Error> {
        self.require_server()?;
        self.with_event(EventKind::SendPush, |session| {
            if !session.remote.enable_push {
                return Err(Http2Error::Config("peer disabled push"));
            }
            if session.goaway_sent || session.goaway_recv {
                return Err(Http2Error::Closed);
            }
            if !session.streams.contains_key(&parent) {
                return Err(Http2Error::UnknownStream(parent));
            }
            let promised = session.next_stream;
            session.next_stream += 2;

            let mut block = BytesMut::new();
            block.put_u32(promised);
            let mut fields = BytesMut::new();
            session.encoder.encode_block(headers, &mut fields);
            block.extend_from_slice(&fields);
            session.emit(
                FrameKind::PushPromise,
                frame::FLAG_END_HEADERS,
                parent,
                &block,
            );

            let mut stream = Stream::new(session.remote.window_size, session.local.window_size);
            // Only the server ever sends on a pushed stream.
            stream.state = StreamState::HalfClosedRemote;
            session.streams.insert(promised, stream);
            if let Some(cb) = session.callbacks.begin.as_mut() {
                cb(promised);
            }
            let _ = flag;
            Ok(promised)
        })
    }

    /// Queue payload bytes on a stream and send whatever flow control
    /// admits; the rest drains on WINDOW_UPDATE.
    ///
    /// `Flag::EndStream` is honoured on the final emitted chunk only.
    pub fn send_data(&mut self, stream: u32, data: &[u8], flag: Flag) -> Result<(), Http2Error> {
        if !self.active {
            return Err(Http2Error::NotInitialized);
        }
        self.with_event(EventKind::SendData, |session| {
            let record = {
                let rec = session
                    .streams
                    .get_mut(&stream)
                    .ok_or(Http2Error::UnknownStream(stream))?;
                if rec.is_send_closed() {
                    return Err(Http2Error::StreamDone(stream));
                }
                rec.buffer.extend_from_slice(data);
                rec.queue.push_back((data.len(), flag));
                rec.queue.len()
            };
            trace!("stream {} queued record #{} ({} bytes)", stream, record, data.len());
            session.pump_stream(stream);
            Ok(())
        })
    }

    /// Raise the peer-visible receive window by `delta`; stream 0
    /// addresses the whole session.
    pub fn window_update(&mut self, stream: u32, delta: u32) -> Result<(), Http2Error> {
        if !self.active {
            return Err(Http2Error::NotInitialized);
        }
        if delta == 0 || delta > settings::MAX_WINDOW_SIZE {
            return Err(Http2Error::Config("window delta out of range"));
        }
        // Window replenishment is fair game between frames of an in-flight
        // receive, so it deliberately stays outside the event guard.
        if stream != 0 && !self.streams.contains_key(&stream) {
            return Err(Http2Error::UnknownStream(stream));
        }
        let mut payload = BytesMut::new();
        payload.put_u32(delta);
        self.emit(FrameKind::WindowUpdate, 0, stream, &payload);
        if stream == 0 {
            self.recv_window += i64::from(delta);
        } else if let Some(rec) = self.streams.get_mut(&stream) {
            rec.recv_window += i64::from(delta);
        }
        self.flush_wire();
        Ok(())
    }

    /// Server: advertise the configured ORIGIN list.
    pub fn send_origin(&mut self) -> Result<(), Http2Error> {
        self.require_server()?;
        if !self.local.origin {
            return Err(Http2Error::Config("ORIGIN frames are not enabled"));
        }
        self.with_event(EventKind::SendOrigin, |session| {
            if session.origins.is_empty() {
                warn!("ORIGIN requested with an empty origin list");
                return Err(Http2Error::Config("empty origin list"));
            }
            let mut payload = BytesMut::new();
            for origin in &session.origins {
                payload.put_u16(origin.len() as u16);
                payload.put_slice(origin.as_bytes());
            }
            session.emit(FrameKind::Origin, 0, 0, &payload);
            Ok(())
        })
    }

    /// Server: advertise the configured alternative services on one
    /// stream.
    pub fn send_altsvc(&mut self, stream: u32) -> Result<(), Http2Error> {
        self.require_server()?;
        if !self.local.altsvc {
            return Err(Http2Error::Config("ALTSVC frames are not enabled"));
        }
        self.with_event(EventKind::SendAltSvc, |session| {
            if session.altsvc.is_empty() {
                warn!("ALTSVC requested with no entries configured");
                return Err(Http2Error::Config("no altsvc entries"));
            }
            let entries = std::mem::take(&mut session.altsvc);
            for (origin, value) in &entries {
                // On a concrete stream the origin travels implicitly.
                let origin_bytes: &[u8] = if stream == 0 { origin.as_bytes() } else { b"" };
                let mut payload = BytesMut::new();
                payload.put_u16(origin_bytes.len() as u16);
                payload.put_slice(origin_bytes);
                payload.put_slice(value.as_bytes());
                session.emit(FrameKind::AltSvc, 0, stream, &payload);
            }
            session.altsvc = entries;
            Ok(())
        })
    }

    // ===== internals =====

    fn require_server(&self) -> Result<(), Http2Error> {
        if !self.active {
            return Err(Http2Error::NotInitialized);
        }
        if self.mode != SessionMode::Server {
            return Err(Http2Error::ServerOnly);
        }
        Ok(())
    }

    /// Run one operation under the event-in-progress guard: deferred
    /// closes wait, the one-shot trigger fires on return to idle, and
    /// emitted frames flush to the `send` callback.
    fn with_event<T>(
        &mut self,
        kind: EventKind,
        op: impl FnOnce(&mut Session) -> Result<T, Http2Error>,
    ) -> Result<T, Http2Error> {
        if self.event != EventState::Idle {
            return Err(Http2Error::Busy);
        }
        self.event = EventState::InEvent(kind);

        let result = op(self);
        if let Err(err) = &result {
            self.report(err);
        }
        self.flush_wire();
        self.completed(kind);
        result
    }

    /// Restore idle if `kind` is the event in progress, fire the one-shot
    /// trigger, then perform any deferred close.
    fn completed(&mut self, kind: EventKind) {
        if self.event != EventState::InEvent(kind) {
            return;
        }
        self.event = EventState::Idle;
        if let Some(mut trigger) = self.trigger.take() {
            trigger();
        }
        if self.pending_close {
            self.pending_close = false;
            self.terminate_quiet();
        }
    }

    fn report(&mut self, err: &Http2Error) {
        let severity = match err {
            Http2Error::Protocol { .. } | Http2Error::Hpack(_) | Http2Error::Config(_) => {
                Severity::Critical
            }
            _ => Severity::Warning,
        };
        match self.callbacks.error.as_mut() {
            Some(cb) => cb(severity, err),
            None if severity == Severity::Critical => warn!("http2: {}", err),
            None => trace!("http2: {}", err),
        }
    }

    /// Append one frame to the wire buffer and account it.
    fn emit(&mut self, kind: FrameKind, flags: u8, stream: u32, payload: &[u8]) {
        let header = FrameHeader::new(kind, flags, stream, payload.len());
        header.encode(&mut self.wire);
        self.wire.extend_from_slice(payload);
        if let Some(cb) = self.callbacks.frame_sent.as_mut() {
            cb(stream, kind, flags);
        }
    }

    fn flush_wire(&mut self) {
        if self.wire.is_empty() {
            return;
        }
        let bytes = self.wire.split().freeze();
        match self.callbacks.send.as_mut() {
            Some(cb) => cb(&bytes),
            None => warn!("{} wire bytes dropped: no send callback", bytes.len()),
        }
    }

    fn emit_goaway(&mut self, last_stream: u32, error: ErrorCode, debug: &[u8]) {
        let mut payload = BytesMut::with_capacity(8 + debug.len());
        payload.put_u32(last_stream & frame::STREAM_ID_MASK);
        payload.put_u32(error.to_wire());
        payload.put_slice(debug);
        self.emit(FrameKind::Goaway, 0, 0, &payload);
    }

    /// HPACK-encode and emit a header block, splitting into HEADERS plus
    /// CONTINUATIONs at the peer's frame size.
    fn emit_header_block(&mut self, stream: u32, headers: &[(String, String)], end_stream: bool) {
        let mut block = BytesMut::new();
        self.encoder.encode_block(headers, &mut block);

        let frame_size = self.remote.frame_size as usize;
        let mut first = true;
        loop {
            let take = block.len().min(frame_size);
            let chunk = block.split_to(take);
            let last = block.is_empty();

            let kind = if first { FrameKind::Headers } else { FrameKind::Continuation };
            let mut flags = 0u8;
            if first && end_stream {
                flags |= frame::FLAG_END_STREAM;
            }
            if last {
                flags |= frame::FLAG_END_HEADERS;
            }
            self.emit(kind, flags, stream, &chunk);

            first = false;
            if last {
                break;
            }
        }
    }

    /// Drain queued records on every stream, ascending id order.
    fn pump_all_streams(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.pump_stream(id);
        }
    }

    /// Emit queued records as far as the windows reach.
    ///
    /// Records split at the natural DATA chunking: at most one frame per
    /// pass, bounded by `min(session window, stream window, frame size)`.
    /// A record's END_STREAM flag is suppressed on every chunk but its
    /// last.
    fn pump_stream(&mut self, id: u32) {
        loop {
            let (size, flag) = {
                let Some(stream) = self.streams.get(&id) else {
                    return;
                };
                match stream.queue.front() {
                    Some(&record) => record,
                    None => return,
                }
            };

            let window = self.available(id).min(self.remote.frame_size as usize);
            if window == 0 && size > 0 {
                trace!("stream {} gated: record of {} bytes, no window", id, size);
                return;
            }
            let take = size.min(window);
            let last = take == size;

            let mut fully_closed = false;
            let (chunk, end) = {
                let Some(stream) = self.streams.get_mut(&id) else {
                    return;
                };
                stream.queue.pop_front();
                let chunk = stream.buffer.split_to(take).freeze();
                let end = last && flag == Flag::EndStream;
                stream.send_window -= take as i64;
                if !last {
                    // The shrunken record head waits for more window.
                    stream.queue.push_front((size - take, flag));
                }
                if end {
                    fully_closed = stream.sent_end_stream();
                }
                (chunk, end)
            };

            self.send_window -= take as i64;
            let flags = if end { frame::FLAG_END_STREAM } else { 0 };
            self.emit(FrameKind::Data, flags, id, &chunk);

            if fully_closed {
                self.close_stream(id, ErrorCode::None);
                return;
            }
        }
    }

    /// Peer finished sending on a stream.
    fn peer_finished(&mut self, id: u32) {
        let closed = match self.streams.get_mut(&id) {
            Some(stream) => stream.recv_end_stream(),
            None => return,
        };
        if closed {
            self.close_stream(id, ErrorCode::None);
        }
    }

    /// We finished sending on a stream.
    fn local_finished(&mut self, id: u32) {
        let closed = match self.streams.get_mut(&id) {
            Some(stream) => stream.sent_end_stream(),
            None => return,
        };
        if closed {
            self.close_stream(id, ErrorCode::None);
        }
    }

    /// Emit RST_STREAM and close the stream locally.
    fn reset_stream(&mut self, id: u32, code: ErrorCode, reason: &'static str) {
        trace!("resetting stream {}: {}", id, reason);
        let mut payload = BytesMut::new();
        payload.put_u32(code.to_wire());
        self.emit(FrameKind::RstStream, 0, id, &payload);
        self.close_stream(id, code);
    }

    /// Drop stream state and fire the close callback.
    fn close_stream(&mut self, id: u32, code: ErrorCode) {
        if self.streams.remove(&id).is_some() {
            if let Some(cb) = self.callbacks.close.as_mut() {
                cb(id, code);
            }
        }
    }

    /// Queue a GOAWAY, notify, and schedule teardown once the current
    /// event completes. Returns the error for propagation.
    fn connection_error(&mut self, code: ErrorCode, message: &'static str) -> Http2Error {
        let last = self.last_peer_stream;
        self.emit_goaway(last, code, &[]);
        self.goaway_sent = true;
        if let Some(cb) = self.callbacks.close.as_mut() {
            cb(0, code);
        }
        self.pending_close = true;
        Http2Error::protocol(0, code, message)
    }

    /// Immediate teardown without emitting anything further.
    fn terminate_quiet(&mut self) {
        self.active = false;
        self.streams.clear();
        self.input.clear();
        self.wire.clear();
        self.continuation = None;
        trace!("http2 session terminated");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.mode)
            .field("active", &self.active)
            .field("event", &self.event)
            .field("streams", &self.streams.len())
            .field("send_window", &self.send_window)
            .finish()
    }
}

/// Strip PADDED framing, or `None` when the padding is malformed.
fn strip_padding<'a>(header: FrameHeader, payload: &'a [u8]) -> Option<&'a [u8]> {
    if !header.has_flag(frame::FLAG_PADDED) {
        return Some(payload);
    }
    let (&pad, rest) = payload.split_first()?;
    if usize::from(pad) > rest.len() {
        return None;
    }
    Some(&rest[..rest.len() - usize::from(pad)])
}
