use crate::{enums::ErrorType, hpack::HeaderField, response::Response, types::*};
use bytes::BytesMut;
use log::trace;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
///
/// The reserved states belong to server push, which this engine neither
/// emits nor accepts, so they never materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// The stream-relevant shape of a frame, after the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEvent {
    Headers { end_stream: bool },
    Data { end_stream: bool },
    Reset,
    WindowUpdate,
    Priority,
}

/// One HTTP/2 stream, owned exclusively by the connection's dispatcher.
#[derive(Debug)]
pub(crate) struct Stream {
    pub id: NonZeroStreamId,
    state: StreamState,
    /// Bytes we may still send; replenished by peer WINDOW_UPDATEs.
    pub send_window: i64,
    /// Bytes the peer may still send us.
    pub recv_window: i64,

    // inbound header block, accumulated across HEADERS + CONTINUATIONs
    pub headers_buffer: BytesMut,
    pub headers_done: bool,
    /// END_STREAM seen on HEADERS/DATA; with an unfinished header block the
    /// stream only ends once END_HEADERS lands.
    pub end_stream_seen: bool,
    pub fields: Vec<HeaderField>,
    pub body: BytesMut,

    // last PRIORITY seen; parsed and remembered, never scheduled on
    dependency: Option<StreamId>,
    exclusive_dependency: Option<bool>,
    weight: Option<u8>,

    // outbound body, parked here whenever a window is exhausted
    pub pending_send: BytesMut,
    pub send_done: bool,
    pub end_sent: bool,
    pub response_started: bool,
    /// Gate for a streaming body producer; flipped false while this stream
    /// has enough parked bytes.
    pub writable: Option<watch::Sender<bool>>,

    /// Client role: the waiter for this request.
    pub response_tx: Option<oneshot::Sender<Result<Response, ClientError>>>,
    pub started_at: Instant,
}

impl Stream {
    pub fn new(id: NonZeroStreamId, send_window: i64, recv_window: i64) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window,
            recv_window,
            headers_buffer: BytesMut::new(),
            headers_done: false,
            end_stream_seen: false,
            fields: Vec::new(),
            body: BytesMut::new(),
            dependency: None,
            exclusive_dependency: None,
            weight: None,
            pending_send: BytesMut::new(),
            send_done: false,
            end_sent: false,
            response_started: false,
            writable: None,
            response_tx: None,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Applies one frame event to the state machine.
    /// https://httpwg.org/specs/rfc7540.html#StreamStates
    pub fn transition(&mut self, recv: bool, event: StreamEvent) -> Result<(), H2Error> {
        use StreamState::*;
        let original = self.state;
        let next = match event {
            // legal in every state, including Idle
            StreamEvent::Priority | StreamEvent::WindowUpdate => original,
            StreamEvent::Reset => {
                if recv && original == Idle {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "RST_STREAM on an idle stream",
                    ));
                }
                Closed
            }
            StreamEvent::Headers { end_stream } | StreamEvent::Data { end_stream } => {
                let headers = matches!(event, StreamEvent::Headers { .. });
                match (recv, original) {
                    (true, Idle) if headers => {
                        if end_stream {
                            HalfClosedRemote
                        } else {
                            Open
                        }
                    }
                    (true, Idle) => {
                        return Err(H2Error::connection(
                            ErrorType::ProtocolError,
                            "DATA on an idle stream",
                        ));
                    }
                    (true, Open) => {
                        if end_stream {
                            HalfClosedRemote
                        } else {
                            Open
                        }
                    }
                    (true, HalfClosedLocal) => {
                        if end_stream {
                            Closed
                        } else {
                            HalfClosedLocal
                        }
                    }
                    (true, HalfClosedRemote | Closed) => {
                        return Err(H2Error::connection(
                            ErrorType::StreamClosed,
                            "frame on a closed stream half",
                        ));
                    }
                    (false, Idle) if headers => {
                        if end_stream {
                            HalfClosedLocal
                        } else {
                            Open
                        }
                    }
                    (false, Open) => {
                        if end_stream {
                            HalfClosedLocal
                        } else {
                            Open
                        }
                    }
                    (false, HalfClosedRemote) => {
                        if end_stream {
                            Closed
                        } else {
                            HalfClosedRemote
                        }
                    }
                    (false, _) => {
                        return Err(H2Error::connection(
                            ErrorType::InternalError,
                            "send on a closed stream half",
                        ));
                    }
                }
            }
        };
        if next != original {
            trace!("stream {} {:?} -> {:?}", self.id, original, next);
            self.state = next;
        }
        Ok(())
    }

    pub fn note_priority(&mut self, dependency: StreamId, exclusive: bool, weight: u8) {
        self.dependency = Some(dependency);
        self.exclusive_dependency = Some(exclusive);
        self.weight = Some(weight);
        trace!(
            "stream {} priority: dep={:?} exclusive={:?} weight={:?}",
            self.id,
            self.dependency,
            self.exclusive_dependency,
            self.weight
        );
    }

    /// Peer replenished our send window. Overflow past 2^31-1 is a
    /// stream-level FLOW_CONTROL_ERROR.
    pub fn add_send_window(&mut self, increment: u32) -> Result<(), H2Error> {
        self.send_window += i64::from(increment);
        if self.send_window > MAX_WINDOW {
            return Err(H2Error::stream(self.id, ErrorType::FlowControlError));
        }
        Ok(())
    }

    /// Accounts a received DATA payload against our receive window.
    pub fn consume_recv_window(&mut self, len: usize) -> Result<(), H2Error> {
        self.recv_window -= len as i64;
        if self.recv_window < 0 {
            return Err(H2Error::stream(self.id, ErrorType::FlowControlError));
        }
        Ok(())
    }

    /// Once consumption dips below half of `max`, hand out a WINDOW_UPDATE
    /// increment restoring the window to `max`.
    pub fn replenish_recv_window(&mut self, max: i64) -> Option<u32> {
        if self.recv_window >= max / 2 {
            return None;
        }
        let increment = max - self.recv_window;
        self.recv_window = max;
        u32::try_from(increment).ok()
    }

    /// Client role: wake the request's waiter.
    pub fn resolve(&mut self, result: Result<Response, ClientError>) {
        if let Some(tx) = self.response_tx.take() {
            // the caller may have given up on the response; that is fine
            tx.send(result).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(NonZeroStreamId::new(1).unwrap(), 65_535, 65_535)
    }

    #[test]
    fn request_lifecycle_server_view() {
        let mut s = stream();
        s.transition(true, StreamEvent::Headers { end_stream: false })
            .unwrap();
        assert_eq!(s.state(), StreamState::Open);
        s.transition(true, StreamEvent::Data { end_stream: true })
            .unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
        s.transition(false, StreamEvent::Headers { end_stream: false })
            .unwrap();
        s.transition(false, StreamEvent::Data { end_stream: true })
            .unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn request_lifecycle_client_view() {
        let mut s = stream();
        s.transition(false, StreamEvent::Headers { end_stream: true })
            .unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedLocal);
        s.transition(true, StreamEvent::Headers { end_stream: false })
            .unwrap();
        s.transition(true, StreamEvent::Data { end_stream: true })
            .unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn data_on_idle_is_protocol_error() {
        let mut s = stream();
        let err = s
            .transition(true, StreamEvent::Data { end_stream: false })
            .unwrap_err();
        assert!(
            matches!(err, H2Error::Connection { error: ErrorType::ProtocolError, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn data_after_end_stream_is_stream_closed() {
        let mut s = stream();
        s.transition(true, StreamEvent::Headers { end_stream: true })
            .unwrap();
        let err = s
            .transition(true, StreamEvent::Data { end_stream: false })
            .unwrap_err();
        assert!(
            matches!(err, H2Error::Connection { error: ErrorType::StreamClosed, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn priority_is_legal_on_idle() {
        let mut s = stream();
        s.transition(true, StreamEvent::Priority).unwrap();
        assert_eq!(s.state(), StreamState::Idle);
    }

    #[test]
    fn reset_on_idle_is_protocol_error() {
        let mut s = stream();
        assert!(s.transition(true, StreamEvent::Reset).is_err());
        s.transition(true, StreamEvent::Headers { end_stream: false })
            .unwrap();
        s.transition(true, StreamEvent::Reset).unwrap();
        assert!(s.is_closed());
    }

    #[test]
    fn send_window_overflow_is_flow_control_error() {
        let mut s = stream();
        s.add_send_window(100).unwrap();
        assert_eq!(s.send_window, 65_635);
        let err = s.add_send_window(u32::MAX >> 1).unwrap_err();
        assert!(matches!(err, H2Error::Stream { error: ErrorType::FlowControlError, .. }));
    }

    #[test]
    fn recv_window_replenishes_below_half() {
        let mut s = stream();
        s.consume_recv_window(10_000).unwrap();
        assert_eq!(s.replenish_recv_window(65_535), None);
        s.consume_recv_window(30_000).unwrap();
        assert_eq!(s.replenish_recv_window(65_535), Some(40_000));
        assert_eq!(s.recv_window, 65_535);
    }

    #[test]
    fn recv_overflow_detected() {
        let mut s = stream();
        assert!(s.consume_recv_window(65_535).is_ok());
        assert!(s.consume_recv_window(1).is_err());
    }
}
