use crate::{enums::*, flags::*, types::*};
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use num_traits::{FromPrimitive, ToPrimitive};
use std::num::NonZeroU32;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;

/// One HTTP/2 frame, decoded past the framing layer: padding stripped,
/// reserved bits masked, per-kind fields pulled out of the payload.
/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        dependency: StreamId,
        exclusive_dependency: bool,
        weight: u8,
        fragment: Bytes,
    },
    Priority {
        stream: NonZeroStreamId,
        dependency: StreamId,
        exclusive_dependency: bool,
        weight: u8,
    },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: StreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: NonZeroU32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
}

impl Frame {
    /// Reads one frame off the wire, bounded by our advertised MAX_FRAME_SIZE.
    /// Frames of a type this engine does not recognize are consumed and
    /// reported as `None`; the connection keeps going (RFC 7540 §4.1).
    pub async fn read_from<R>(
        reader: &mut R,
        max_frame_size: u32,
    ) -> Result<Option<Self>, FrameDecodeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0_u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]);
        if length > max_frame_size {
            return Err(FrameDecodeError::FrameTooLarge {
                length,
                max: max_frame_size,
            });
        }
        let mut payload = vec![0_u8; length as usize];
        reader.read_exact(&mut payload).await?;

        let stream_id =
            u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & U31_MAX;
        let Some(typ) = FrameType::from_u8(header[3]) else {
            trace!("skipping unknown frame type {:#x} ({length} bytes)", header[3]);
            return Ok(None);
        };
        Self::decode(typ, header[4], stream_id, payload.into()).map(Some)
    }

    fn decode(
        typ: FrameType,
        raw_flags: u8,
        stream_id: StreamId,
        payload: Bytes,
    ) -> Result<Self, FrameDecodeError> {
        Ok(match typ {
            FrameType::Data => {
                let stream = require_stream(stream_id)?;
                let flags = DataFlags::from_bits_truncate(raw_flags);
                let data = strip_padding(payload, flags.contains(DataFlags::PADDED))?;
                Self::Data { stream, flags, data }
            }
            FrameType::Headers => {
                let stream = require_stream(stream_id)?;
                let flags = HeadersFlags::from_bits_truncate(raw_flags);
                let mut fragment =
                    strip_padding(payload, flags.contains(HeadersFlags::PADDED))?;
                let (dependency, exclusive_dependency, weight) =
                    if flags.contains(HeadersFlags::PRIORITY) {
                        if fragment.len() < 5 {
                            return Err(FrameDecodeError::PayloadTooShort);
                        }
                        let priority = fragment.split_to(5);
                        let dep = u32::from_be_bytes([
                            priority[0],
                            priority[1],
                            priority[2],
                            priority[3],
                        ]);
                        (dep & U31_MAX, dep & !U31_MAX != 0, priority[4])
                    } else {
                        (0, false, 0)
                    };
                Self::Headers {
                    stream,
                    flags,
                    dependency,
                    exclusive_dependency,
                    weight,
                    fragment,
                }
            }
            FrameType::Priority => {
                let stream = require_stream(stream_id)?;
                if payload.len() != 5 {
                    return Err(FrameDecodeError::BadPayloadLength);
                }
                let dep = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Self::Priority {
                    stream,
                    dependency: dep & U31_MAX,
                    exclusive_dependency: dep & !U31_MAX != 0,
                    weight: payload[4],
                }
            }
            FrameType::ResetStream => {
                let stream = require_stream(stream_id)?;
                if payload.len() != 4 {
                    return Err(FrameDecodeError::BadPayloadLength);
                }
                let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Self::ResetStream {
                    stream,
                    error: ErrorType::from_wire(code),
                }
            }
            FrameType::Settings => {
                if stream_id != 0 {
                    return Err(FrameDecodeError::NonZeroStreamId);
                }
                let flags = SettingsFlags::from_bits_truncate(raw_flags);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(FrameDecodeError::BadAckPayload);
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameDecodeError::BadSettingsLength);
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                for chunk in payload.chunks(6) {
                    // spec says to ignore unknown settings
                    if let Some(param) =
                        SettingsParameter::from_u16(u16::from_be_bytes([chunk[0], chunk[1]]))
                    {
                        params.push((
                            param,
                            u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                        ));
                    }
                }
                Self::Settings { flags, params }
            }
            FrameType::PushPromise => {
                let stream = require_stream(stream_id)?;
                let flags = PushPromiseFlags::from_bits_truncate(raw_flags);
                let mut fragment =
                    strip_padding(payload, flags.contains(PushPromiseFlags::PADDED))?;
                if fragment.len() < 4 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let id = fragment.split_to(4);
                Self::PushPromise {
                    stream,
                    flags,
                    promised: u32::from_be_bytes([id[0], id[1], id[2], id[3]]) & U31_MAX,
                    fragment,
                }
            }
            FrameType::Ping => {
                if stream_id != 0 {
                    return Err(FrameDecodeError::NonZeroStreamId);
                }
                if payload.len() != 8 {
                    return Err(FrameDecodeError::BadPayloadLength);
                }
                Self::Ping {
                    flags: PingFlags::from_bits_truncate(raw_flags),
                    // unwrap: length checked right above
                    data: payload.as_ref().try_into().unwrap(),
                }
            }
            FrameType::GoAway => {
                if stream_id != 0 {
                    return Err(FrameDecodeError::NonZeroStreamId);
                }
                if payload.len() < 8 {
                    return Err(FrameDecodeError::PayloadTooShort);
                }
                let mut payload = payload;
                let head = payload.split_to(8);
                Self::GoAway {
                    last_stream: u32::from_be_bytes([head[0], head[1], head[2], head[3]])
                        & U31_MAX,
                    error: ErrorType::from_wire(u32::from_be_bytes([
                        head[4], head[5], head[6], head[7],
                    ])),
                    debug: payload,
                }
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(FrameDecodeError::BadPayloadLength);
                }
                let raw = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Self::WindowUpdate {
                    stream: stream_id,
                    increment: NonZeroU32::new(raw & U31_MAX)
                        .ok_or(FrameDecodeError::ZeroWindowIncrement)?,
                }
            }
            FrameType::Continuation => Self::Continuation {
                stream: require_stream(stream_id)?,
                flags: ContinuationFlags::from_bits_truncate(raw_flags),
                fragment: payload,
            },
        })
    }

    /// Serializes into `dst`. Padding is never emitted; the PADDED bit is
    /// dropped so the length field stays honest.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Data { stream, flags, data } => {
                let flags = *flags - DataFlags::PADDED;
                put_head(dst, data.len(), FrameType::Data, flags.bits(), stream.get());
                dst.extend_from_slice(data);
            }
            Self::Headers {
                stream,
                flags,
                dependency,
                exclusive_dependency,
                weight,
                fragment,
            } => {
                let flags = *flags - HeadersFlags::PADDED;
                let priority = flags.contains(HeadersFlags::PRIORITY);
                let length = fragment.len() + if priority { 5 } else { 0 };
                put_head(dst, length, FrameType::Headers, flags.bits(), stream.get());
                if priority {
                    put_dependency(dst, *dependency, *exclusive_dependency, *weight);
                }
                dst.extend_from_slice(fragment);
            }
            Self::Priority {
                stream,
                dependency,
                exclusive_dependency,
                weight,
            } => {
                put_head(dst, 5, FrameType::Priority, 0, stream.get());
                put_dependency(dst, *dependency, *exclusive_dependency, *weight);
            }
            Self::ResetStream { stream, error } => {
                put_head(dst, 4, FrameType::ResetStream, 0, stream.get());
                // unwrap: ErrorType is repr(u32)
                dst.put_u32(error.to_u32().unwrap());
            }
            Self::Settings { flags, params } => {
                put_head(
                    dst,
                    params.len() * 6,
                    FrameType::Settings,
                    flags.bits(),
                    0,
                );
                for (param, value) in params {
                    // unwrap: SettingsParameter is repr(u16)
                    dst.put_u16(param.to_u16().unwrap());
                    dst.put_u32(*value);
                }
            }
            Self::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => {
                let flags = *flags - PushPromiseFlags::PADDED;
                put_head(
                    dst,
                    fragment.len() + 4,
                    FrameType::PushPromise,
                    flags.bits(),
                    stream.get(),
                );
                dst.put_u32(promised & U31_MAX);
                dst.extend_from_slice(fragment);
            }
            Self::Ping { flags, data } => {
                put_head(dst, 8, FrameType::Ping, flags.bits(), 0);
                dst.extend_from_slice(data);
            }
            Self::GoAway {
                last_stream,
                error,
                debug,
            } => {
                put_head(dst, 8 + debug.len(), FrameType::GoAway, 0, 0);
                dst.put_u32(last_stream & U31_MAX);
                // unwrap: ErrorType is repr(u32)
                dst.put_u32(error.to_u32().unwrap());
                dst.extend_from_slice(debug);
            }
            Self::WindowUpdate { stream, increment } => {
                put_head(dst, 4, FrameType::WindowUpdate, 0, *stream);
                dst.put_u32(increment.get() & U31_MAX);
            }
            Self::Continuation {
                stream,
                flags,
                fragment,
            } => {
                put_head(
                    dst,
                    fragment.len(),
                    FrameType::Continuation,
                    flags.bits(),
                    stream.get(),
                );
                dst.extend_from_slice(fragment);
            }
        }
    }

    pub async fn write_into<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 64);
        self.encode(&mut buf);
        writer.write_all(&buf).await
    }

    /// The 9-byte framing header as it would appear on the wire.
    #[must_use]
    pub fn header_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + 64);
        self.encode(&mut buf);
        // unwrap: encode always writes the 9-byte head first
        buf[..FRAME_HEADER_LEN].try_into().unwrap()
    }

    /// Stream the frame addresses; 0 for connection-scoped kinds.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Data { stream, .. }
            | Self::Headers { stream, .. }
            | Self::Priority { stream, .. }
            | Self::ResetStream { stream, .. }
            | Self::PushPromise { stream, .. }
            | Self::Continuation { stream, .. } => stream.get(),
            Self::WindowUpdate { stream, .. } => *stream,
            Self::Settings { .. } | Self::Ping { .. } | Self::GoAway { .. } => 0,
        }
    }
}

fn require_stream(stream_id: StreamId) -> Result<NonZeroStreamId, FrameDecodeError> {
    NonZeroStreamId::new(stream_id).ok_or(FrameDecodeError::ZeroStreamId)
}

fn strip_padding(mut payload: Bytes, padded: bool) -> Result<Bytes, FrameDecodeError> {
    if !padded {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameDecodeError::PayloadTooShort);
    }
    let pad = payload.split_to(1)[0] as usize;
    if pad >= payload.len() + 1 {
        // Padding that swallows the whole payload is a protocol error.
        return Err(FrameDecodeError::BadPadding);
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

fn put_head(dst: &mut BytesMut, length: usize, typ: FrameType, flags: u8, stream: StreamId) {
    dst.reserve(FRAME_HEADER_LEN + length);
    dst.put_uint(length as u64, 3);
    // unwrap: FrameType is repr(u8)
    dst.put_u8(typ.to_u8().unwrap());
    dst.put_u8(flags);
    dst.put_u32(stream & U31_MAX);
}

fn put_dependency(dst: &mut BytesMut, dependency: StreamId, exclusive: bool, weight: u8) {
    let dep = (dependency & U31_MAX) | if exclusive { !U31_MAX } else { 0 };
    dst.put_u32(dep);
    dst.put_u8(weight);
}
