use std::collections::VecDeque;

use bytes::BytesMut;

/// Per-stream lifecycle, server view of RFC 9113 §5.1 collapsed to the
/// states the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// User-visible flag on headers/data submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    None,
    /// Finish the sending side of the stream with this submission.
    EndStream,
}

/// One active stream.
///
/// Outbound payload is queued as `(size, flag)` records over a shared byte
/// buffer; the sum of queued record sizes always equals the buffer length.
/// Records drain when flow-control windows open, chunked only at DATA-frame
/// granularity, with END_STREAM honoured on the final chunk alone.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) state: StreamState,
    pub(crate) send_window: i64,
    pub(crate) recv_window: i64,
    pub(crate) queue: VecDeque<(usize, Flag)>,
    pub(crate) buffer: BytesMut,
}

impl Stream {
    pub(crate) fn new(send_window: u32, recv_window: u32) -> Stream {
        Stream {
            state: StreamState::Idle,
            send_window: i64::from(send_window),
            recv_window: i64::from(recv_window),
            queue: VecDeque::new(),
            buffer: BytesMut::new(),
        }
    }

    /// Queued-but-unsent payload bytes.
    pub(crate) fn backlog(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn is_send_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedLocal | StreamState::Closed)
    }

    pub(crate) fn is_recv_closed(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedRemote | StreamState::Closed)
    }

    /// Local END_STREAM went out; returns true when the stream fully
    /// closed.
    pub(crate) fn sent_end_stream(&mut self) -> bool {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedLocal => StreamState::HalfClosedLocal,
        };
        self.state == StreamState::Closed
    }

    /// Peer END_STREAM arrived; returns true when the stream fully closed.
    pub(crate) fn recv_end_stream(&mut self) -> bool {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            StreamState::HalfClosedRemote => StreamState::HalfClosedRemote,
        };
        self.state == StreamState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_directions_close() {
        let mut stream = Stream::new(65_535, 65_535);
        stream.state = StreamState::Open;
        assert!(!stream.sent_end_stream());
        assert_eq!(stream.state, StreamState::HalfClosedLocal);
        assert!(stream.recv_end_stream());
        assert_eq!(stream.state, StreamState::Closed);
    }

    #[test]
    fn queue_tracks_buffer() {
        let mut stream = Stream::new(10, 10);
        stream.buffer.extend_from_slice(b"hello");
        stream.queue.push_back((5, Flag::EndStream));
        let queued: usize = stream.queue.iter().map(|(size, _)| size).sum();
        assert_eq!(queued, stream.backlog());
    }
}
