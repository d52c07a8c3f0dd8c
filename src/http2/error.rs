use thiserror::Error;

/// HTTP/2 error codes, one-to-one with the wire registry (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    Compression = 0x9,
    Connect = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_wire(code: u32) -> ErrorCode {
        match code {
            0x0 => ErrorCode::None,
            0x1 => ErrorCode::Protocol,
            0x2 => ErrorCode::Internal,
            0x3 => ErrorCode::FlowControl,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSize,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::Compression,
            0xa => ErrorCode::Connect,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            // Unknown codes must be treated as INTERNAL_ERROR.
            _ => ErrorCode::Internal,
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Severity attached to the error callback, mirroring how faults are
/// logged when no callback is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

/// Typed engine error.
///
/// Protocol faults carry the wire [`ErrorCode`] they map onto; everything
/// else is a local misuse of the session surface.
#[derive(Debug, Error)]
pub enum Http2Error {
    #[error("protocol error on stream {stream}: {message} ({code:?})")]
    Protocol {
        stream: u32,
        code: ErrorCode,
        message: &'static str,
    },

    #[error("header compression error: {0}")]
    Hpack(&'static str),

    #[error("session is not initialized")]
    NotInitialized,

    #[error("session cannot be re-initialized while an event is in progress")]
    Busy,

    #[error("session is closed")]
    Closed,

    #[error("operation requires a server session")]
    ServerOnly,

    #[error("operation requires a client session")]
    ClientOnly,

    #[error("unknown stream {0}")]
    UnknownStream(u32),

    #[error("stream {0} is closed for sending")]
    StreamDone(u32),

    #[error("invalid setting value: {0}")]
    InvalidSetting(&'static str),

    #[error("{0}")]
    Config(&'static str),
}

impl Http2Error {
    pub(crate) fn protocol(stream: u32, code: ErrorCode, message: &'static str) -> Http2Error {
        Http2Error::Protocol {
            stream,
            code,
            message,
        }
    }

    /// The wire code a connection close caused by this error reports.
    pub fn code(&self) -> ErrorCode {
        match self {
            Http2Error::Protocol { code, .. } => *code,
            Http2Error::Hpack(_) => ErrorCode::Compression,
            Http2Error::InvalidSetting(_) | Http2Error::Config(_) => ErrorCode::Internal,
            _ => ErrorCode::Internal,
        }
    }
}
