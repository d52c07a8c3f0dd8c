use bytes::{BufMut, BytesMut};

/// Client connection preface, sent before the first SETTINGS frame.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Fixed size of a frame header on the wire.
pub const HEADER_LEN: usize = 9;

/// Stream ids are 31-bit; id 0 addresses the connection itself.
pub const STREAM_ID_MASK: u32 = 0x7fff_ffff;

pub const FLAG_END_STREAM: u8 = 0x1;
/// Same bit as END_STREAM, used by SETTINGS and PING.
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// Frame types, including the ALTSVC/ORIGIN extensions and
/// PRIORITY_UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    Goaway,
    WindowUpdate,
    Continuation,
    AltSvc,
    Origin,
    PriorityUpdate,
    /// Extension frames are valid and skipped.
    Unknown(u8),
}

impl FrameKind {
    pub fn from_wire(kind: u8) -> FrameKind {
        match kind {
            0x0 => FrameKind::Data,
            0x1 => FrameKind::Headers,
            0x2 => FrameKind::Priority,
            0x3 => FrameKind::RstStream,
            0x4 => FrameKind::Settings,
            0x5 => FrameKind::PushPromise,
            0x6 => FrameKind::Ping,
            0x7 => FrameKind::Goaway,
            0x8 => FrameKind::WindowUpdate,
            0x9 => FrameKind::Continuation,
            0xa => FrameKind::AltSvc,
            0xc => FrameKind::Origin,
            0x10 => FrameKind::PriorityUpdate,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            FrameKind::Data => 0x0,
            FrameKind::Headers => 0x1,
            FrameKind::Priority => 0x2,
            FrameKind::RstStream => 0x3,
            FrameKind::Settings => 0x4,
            FrameKind::PushPromise => 0x5,
            FrameKind::Ping => 0x6,
            FrameKind::Goaway => 0x7,
            FrameKind::WindowUpdate => 0x8,
            FrameKind::Continuation => 0x9,
            FrameKind::AltSvc => 0xa,
            FrameKind::Origin => 0xc,
            FrameKind::PriorityUpdate => 0x10,
            FrameKind::Unknown(other) => other,
        }
    }
}

/// The 9-byte header in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: FrameKind,
    pub flags: u8,
    pub stream: u32,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, flags: u8, stream: u32, length: usize) -> FrameHeader {
        FrameHeader {
            length: length as u32,
            kind,
            flags,
            stream: stream & STREAM_ID_MASK,
        }
    }

    pub fn parse(buf: &[u8; HEADER_LEN]) -> FrameHeader {
        let length = u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2]);
        let kind = FrameKind::from_wire(buf[3]);
        let flags = buf[4];
        let stream =
            u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & STREAM_ID_MASK;
        FrameHeader {
            length,
            kind,
            flags,
            stream,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.length as usize);
        dst.put_u8((self.length >> 16) as u8);
        dst.put_u8((self.length >> 8) as u8);
        dst.put_u8(self.length as u8);
        dst.put_u8(self.kind.to_wire());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream & STREAM_ID_MASK);
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(FrameKind::Headers, FLAG_END_HEADERS, 3, 1234);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf);
        assert_eq!(FrameHeader::parse(&raw), header);
    }

    #[test]
    fn reserved_stream_bit_is_masked() {
        let raw = [0, 0, 0, 0x0, 0, 0xff, 0xff, 0xff, 0xff];
        let header = FrameHeader::parse(&raw);
        assert_eq!(header.stream, STREAM_ID_MASK);
    }

    #[test]
    fn extension_kinds_survive() {
        for kind in [0xa_u8, 0xc, 0x10, 0x42] {
            assert_eq!(FrameKind::from_wire(kind).to_wire(), kind);
        }
    }
}
