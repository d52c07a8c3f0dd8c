use bytes::{BufMut, BytesMut};

use super::error::Http2Error;

/// Session configuration knobs accepted by [`Session::init`].
///
/// The first seven map onto SETTINGS identifiers on the wire; the last two
/// are engine-local switches gating the ALTSVC and ORIGIN extension
/// frames and never travel.
///
/// [`Session::init`]: super::Session::init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    /// HPACK dynamic table size (0x1).
    HeaderTableSize,
    /// Whether the peer may push (0x2).
    EnablePush,
    /// Maximum concurrent streams (0x3).
    Streams,
    /// Initial stream flow-control window (0x4).
    WindowSize,
    /// Maximum frame payload (0x5).
    FrameSize,
    /// Maximum accepted header list size (0x6).
    PayloadSize,
    /// Extended CONNECT (0x8).
    Connect,
    /// Allow emitting/consuming ALTSVC frames.
    EnableAltSvc,
    /// Allow emitting/consuming ORIGIN frames.
    EnableOrigin,
}

pub(crate) const ID_HEADER_TABLE_SIZE: u16 = 0x1;
pub(crate) const ID_ENABLE_PUSH: u16 = 0x2;
pub(crate) const ID_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub(crate) const ID_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub(crate) const ID_MAX_FRAME_SIZE: u16 = 0x5;
pub(crate) const ID_MAX_HEADER_LIST_SIZE: u16 = 0x6;
pub(crate) const ID_ENABLE_CONNECT_PROTOCOL: u16 = 0x8;

pub(crate) const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub(crate) const DEFAULT_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_FRAME_SIZE: u32 = 16_777_215;
pub(crate) const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// One side's effective settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) header_table_size: u32,
    pub(crate) enable_push: bool,
    pub(crate) max_streams: Option<u32>,
    pub(crate) window_size: u32,
    pub(crate) frame_size: u32,
    pub(crate) max_header_list: Option<u32>,
    pub(crate) connect: bool,
    pub(crate) altsvc: bool,
    pub(crate) origin: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            header_table_size: 4096,
            enable_push: true,
            max_streams: None,
            window_size: DEFAULT_WINDOW_SIZE,
            frame_size: DEFAULT_FRAME_SIZE,
            max_header_list: None,
            connect: false,
            altsvc: false,
            origin: false,
        }
    }
}

impl Settings {
    /// Apply one user-supplied entry, validating ranges the way the wire
    /// protocol does.
    pub(crate) fn apply(&mut self, setting: Setting, value: u32) -> Result<(), Http2Error> {
        match setting {
            Setting::HeaderTableSize => self.header_table_size = value,
            Setting::EnablePush => match value {
                0 => self.enable_push = false,
                1 => self.enable_push = true,
                _ => return Err(Http2Error::InvalidSetting("ENABLE_PUSH must be 0 or 1")),
            },
            Setting::Streams => self.max_streams = Some(value),
            Setting::WindowSize => {
                if value > MAX_WINDOW_SIZE {
                    return Err(Http2Error::InvalidSetting("window size above 2^31-1"));
                }
                self.window_size = value;
            }
            Setting::FrameSize => {
                if !(DEFAULT_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&value) {
                    return Err(Http2Error::InvalidSetting(
                        "frame size outside 16384..=16777215",
                    ));
                }
                self.frame_size = value;
            }
            Setting::PayloadSize => self.max_header_list = Some(value),
            Setting::Connect => match value {
                0 => self.connect = false,
                1 => self.connect = true,
                _ => return Err(Http2Error::InvalidSetting("CONNECT must be 0 or 1")),
            },
            Setting::EnableAltSvc => self.altsvc = value != 0,
            Setting::EnableOrigin => self.origin = value != 0,
        }
        Ok(())
    }

    /// Serialize the wire-visible entries as a SETTINGS payload.
    pub(crate) fn encode_payload(&self, dst: &mut BytesMut) {
        let mut put = |id: u16, value: u32| {
            dst.put_u16(id);
            dst.put_u32(value);
        };
        put(ID_HEADER_TABLE_SIZE, self.header_table_size);
        put(ID_ENABLE_PUSH, u32::from(self.enable_push));
        if let Some(streams) = self.max_streams {
            put(ID_MAX_CONCURRENT_STREAMS, streams);
        }
        put(ID_INITIAL_WINDOW_SIZE, self.window_size);
        put(ID_MAX_FRAME_SIZE, self.frame_size);
        if let Some(max) = self.max_header_list {
            put(ID_MAX_HEADER_LIST_SIZE, max);
        }
        if self.connect {
            put(ID_ENABLE_CONNECT_PROTOCOL, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_window() {
        let mut settings = Settings::default();
        assert!(settings.apply(Setting::WindowSize, MAX_WINDOW_SIZE + 1).is_err());
        assert!(settings.apply(Setting::WindowSize, 32).is_ok());
        assert_eq!(settings.window_size, 32);
    }

    #[test]
    fn rejects_bad_frame_size() {
        let mut settings = Settings::default();
        assert!(settings.apply(Setting::FrameSize, 100).is_err());
        assert!(settings.apply(Setting::FrameSize, MAX_FRAME_SIZE + 1).is_err());
        assert!(settings.apply(Setting::FrameSize, 16_384).is_ok());
    }

    #[test]
    fn extension_toggles_stay_off_the_wire() {
        let mut settings = Settings::default();
        settings.apply(Setting::EnableAltSvc, 1).unwrap();
        settings.apply(Setting::EnableOrigin, 1).unwrap();
        let mut buf = BytesMut::new();
        settings.encode_payload(&mut buf);
        // Six-byte entries only; ids 0x1..=0x6 and maybe 0x8.
        assert_eq!(buf.len() % 6, 0);
        for entry in buf.chunks(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            assert!(id <= ID_ENABLE_CONNECT_PROTOCOL);
        }
    }
}
