use crate::enums::ErrorType;
use std::num::NonZeroU32;

/// Stream id mask; the high bit of the 32-bit field on the wire is reserved.
pub const U31_MAX: u32 = u32::MAX >> 1;

/// Largest legal flow-control window (2^31 - 1).
pub const MAX_WINDOW: i64 = U31_MAX as i64;

pub type StreamId = u32;
pub type NonZeroStreamId = NonZeroU32;

/// Ordered header multimap. Names repeat (e.g. `set-cookie`), order matters
/// for pseudo-headers, so a plain vec of pairs it is.
pub type Headers = Vec<(String, String)>;

#[derive(thiserror::Error, Debug)]
pub enum FrameDecodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: u32, max: u32 },
    #[error("payload is shorter than expected")]
    PayloadTooShort,
    #[error("payload length does not match the frame type")]
    BadPayloadLength,
    #[error("unexpected 0 stream ID")]
    ZeroStreamId,
    #[error("unexpected non-0 stream ID")]
    NonZeroStreamId,
    #[error("unexpected 0 window increment")]
    ZeroWindowIncrement,
    #[error("pad length exceeds the payload")]
    BadPadding,
    #[error("SETTINGS payload is not a multiple of 6 bytes")]
    BadSettingsLength,
    #[error("SETTINGS ACK with a non-empty payload")]
    BadAckPayload,
}

impl FrameDecodeError {
    /// RFC 7540 error code this decode failure maps to.
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::FrameTooLarge { .. }
            | Self::PayloadTooShort
            | Self::BadPayloadLength
            | Self::BadSettingsLength
            | Self::BadAckPayload => ErrorType::FrameSizeError,
            Self::Io(_) => ErrorType::InternalError,
            _ => ErrorType::ProtocolError,
        }
    }
}

/// Engine-level failure, scoped per spec: connection errors tear the
/// connection down with GOAWAY, stream errors reset a single stream.
#[derive(thiserror::Error, Debug)]
pub enum H2Error {
    #[error("connection error {error:?}: {reason}")]
    Connection { error: ErrorType, reason: String },
    #[error("stream {stream} error {error:?}")]
    Stream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl H2Error {
    pub fn connection(error: ErrorType, reason: impl Into<String>) -> Self {
        Self::Connection {
            error,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn stream(stream: NonZeroStreamId, error: ErrorType) -> Self {
        Self::Stream { stream, error }
    }
}

impl From<FrameDecodeError> for H2Error {
    fn from(err: FrameDecodeError) -> Self {
        match err {
            FrameDecodeError::Io(err) => Self::Io(err),
            other => Self::Connection {
                error: other.error_type(),
                reason: other.to_string(),
            },
        }
    }
}

/// What a client caller can see go wrong with a request.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("request deadline exceeded")]
    RequestCanceled,
    #[error("connection timed out")]
    Timeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("stream refused by peer")]
    Refused,
    #[error("stream reset by peer: {0:?}")]
    Reset(ErrorType),
    #[error("peer sent GOAWAY {error:?}: {debug}")]
    GoAway { error: ErrorType, debug: String },
    #[error("TLS peer did not negotiate h2")]
    AlpnRejected,
    #[error("invalid URL: {0}")]
    Url(String),
    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error(transparent)]
    Protocol(#[from] H2Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Refused streams and graceful shutdown leave the request untouched;
    /// callers may safely retry on another connection.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Refused | Self::ConnectionClosed | Self::GoAway { error: ErrorType::NoError, .. }
        )
    }
}
