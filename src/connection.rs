//! Per-connection machinery shared by both engines, plus the client-side
//! connection. One connection runs three cooperating tasks (reader,
//! dispatcher, writer) joined by two bounded frame queues; the dispatcher
//! exclusively owns the HPACK tables and the stream map, so neither needs a
//! lock. Only the connection send window, the closed flag, the ping counter
//! and the stream counts cross task boundaries, as atomics.

use crate::{
    enums::*,
    flags::*,
    frame::Frame,
    hpack,
    request::Request,
    response::Response,
    settings::Settings,
    stream::StreamEvent,
    stream_coordinator::StreamCoordinator,
    types::*,
};
use bytes::Bytes;
use log::{debug, error, trace, warn};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{sleep_until, Duration, Instant},
};
use tokio_rustls::{rustls, TlsConnector};
use url::Url;

/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub(crate) const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Depth of the reader→dispatcher and dispatcher→writer frame queues.
pub(crate) const QUEUE_DEPTH: usize = 128;

/// The writer flushes after this many frames even if its queue has more.
pub(crate) const FLUSH_EVERY: usize = 10;

/// Unacknowledged pings before the connection counts as dead.
pub(crate) const MAX_OUTSTANDING_PINGS: u32 = 3;

/// Parked outbound bytes per stream above which a streaming body producer
/// is gated off.
pub(crate) const WRITABLE_HIGH_WATER: usize = 64 * 1024;

/// The few fields shared across a connection's tasks; everything else is
/// single-owner (dispatcher).
#[derive(Debug)]
pub(crate) struct Shared {
    /// Connection-level send window. The reader credits it on stream-0
    /// WINDOW_UPDATE, the dispatcher debits it when emitting DATA.
    pub send_window: AtomicI64,
    pub closed: AtomicBool,
    pub outstanding_pings: AtomicU32,
    pub open_streams: AtomicU32,
    pub last_peer_stream_id: AtomicU32,
    pub remote_max_concurrent: AtomicU32,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            send_window: AtomicI64::new(i64::from(
                crate::settings::DEFAULT_INITIAL_WINDOW_SIZE,
            )),
            closed: AtomicBool::new(false),
            outstanding_pings: AtomicU32::new(0),
            open_streams: AtomicU32::new(0),
            last_peer_stream_id: AtomicU32::new(0),
            remote_max_concurrent: AtomicU32::new(u32::MAX),
        }
    }
}

/// Everything a dispatcher can be woken by.
#[derive(Debug)]
pub(crate) enum Event {
    Frame(Frame),
    /// The connection send window was replenished; parked bodies may move.
    WindowNudge,
    PeerGoaway {
        last_stream: StreamId,
        error: ErrorType,
        debug: String,
    },
    PingTimeout,
    /// The reader hit a fatal read or decode failure.
    ConnectionError(H2Error),
    // client role
    Request {
        request: Request,
        response_tx: oneshot::Sender<Result<Response, ClientError>>,
    },
    Shutdown,
    // server role
    Response {
        stream: NonZeroStreamId,
        response: Response,
    },
    HandlerFailed {
        stream: NonZeroStreamId,
    },
    BodyChunk {
        stream: NonZeroStreamId,
        data: Bytes,
    },
    BodyEnd {
        stream: NonZeroStreamId,
    },
}

/// Reads frames until the connection dies. Connection-scoped bookkeeping
/// frames (PING, stream-0 WINDOW_UPDATE, GOAWAY) are handled inline; frames
/// touching dispatcher-owned state are forwarded.
pub(crate) async fn reader_task<R>(
    mut reader: R,
    shared: Arc<Shared>,
    events: mpsc::Sender<Event>,
    writes: mpsc::Sender<Frame>,
    max_frame_size: u32,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match Frame::read_from(&mut reader, max_frame_size).await {
            Ok(None) => {}
            Ok(Some(Frame::Ping { flags, data })) => {
                if flags.contains(PingFlags::ACK) {
                    trace!("pong {data:?}");
                    shared.outstanding_pings.store(0, Ordering::SeqCst);
                } else if writes
                    .send(Frame::Ping {
                        flags: PingFlags::ACK,
                        data,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(Frame::WindowUpdate {
                stream: 0,
                increment,
            })) => {
                let increment = i64::from(increment.get());
                let updated = shared.send_window.fetch_add(increment, Ordering::SeqCst) + increment;
                if updated > MAX_WINDOW {
                    events
                        .send(Event::ConnectionError(H2Error::connection(
                            ErrorType::FlowControlError,
                            "connection send window overflow",
                        )))
                        .await
                        .ok();
                    break;
                }
                if events.send(Event::WindowNudge).await.is_err() {
                    break;
                }
            }
            Ok(Some(Frame::GoAway {
                last_stream,
                error,
                debug,
            })) => {
                let debug = String::from_utf8_lossy(&debug).into_owned();
                if error == ErrorType::NoError {
                    debug!("peer GOAWAY: graceful, last stream {last_stream}");
                } else {
                    error!("peer GOAWAY {error:?}: {debug}");
                }
                shared.closed.store(true, Ordering::SeqCst);
                if events
                    .send(Event::PeerGoaway {
                        last_stream,
                        error,
                        debug,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Some(frame)) => {
                if events.send(Event::Frame(frame)).await.is_err() {
                    break;
                }
            }
            Err(FrameDecodeError::Io(err)) => {
                if !shared.closed.load(Ordering::SeqCst) {
                    debug!("connection read failed: {err}");
                    events.send(Event::ConnectionError(err.into())).await.ok();
                }
                break;
            }
            Err(err) => {
                events.send(Event::ConnectionError(err.into())).await.ok();
                break;
            }
        }
    }
}

/// Drains the outbound queue, flushing when it runs dry or after
/// `FLUSH_EVERY` frames, and owns the ping keepalive.
pub(crate) async fn writer_task<W>(
    mut writer: W,
    shared: Arc<Shared>,
    mut writes: mpsc::Receiver<Frame>,
    events: mpsc::Sender<Event>,
    ping_interval: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut pings_sent: u64 = 0;
    let mut ping_timer =
        tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            maybe_frame = writes.recv() => {
                let Some(mut frame) = maybe_frame else { break };
                let mut buffered = 0;
                loop {
                    if let Err(err) = frame.write_into(&mut writer).await {
                        debug!("connection write failed: {err}");
                        shared.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                    buffered += 1;
                    if buffered >= FLUSH_EVERY {
                        break;
                    }
                    match writes.try_recv() {
                        Ok(next) => frame = next,
                        Err(_) => break,
                    }
                }
                if writer.flush().await.is_err() {
                    shared.closed.store(true, Ordering::SeqCst);
                    return;
                }
            }
            _ = ping_timer.tick() => {
                if shared.closed.load(Ordering::SeqCst) {
                    continue;
                }
                let outstanding = shared.outstanding_pings.load(Ordering::SeqCst);
                if outstanding >= MAX_OUTSTANDING_PINGS {
                    warn!("{outstanding} pings unacknowledged; connection is dead");
                    shared.closed.store(true, Ordering::SeqCst);
                    Frame::GoAway {
                        last_stream: shared.last_peer_stream_id.load(Ordering::SeqCst),
                        error: ErrorType::NoError,
                        debug: Bytes::new(),
                    }
                    .write_into(&mut writer)
                    .await
                    .ok();
                    writer.flush().await.ok();
                    events.send(Event::PingTimeout).await.ok();
                    return;
                }
                shared.outstanding_pings.fetch_add(1, Ordering::SeqCst);
                pings_sent += 1;
                let ping = Frame::Ping {
                    flags: PingFlags::empty(),
                    data: pings_sent.to_be_bytes(),
                };
                if ping.write_into(&mut writer).await.is_err()
                    || writer.flush().await.is_err()
                {
                    shared.closed.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
    // dispatcher is gone and the queue is drained
    writer.shutdown().await.ok();
}

pub(crate) fn writer_gone() -> H2Error {
    H2Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "writer task gone"))
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Our advertised MAX_FRAME_SIZE; bounds every inbound frame.
    pub max_frame_size: u32,
    /// Our advertised per-stream INITIAL_WINDOW_SIZE.
    pub initial_window_size: u32,
    pub max_concurrent_streams: u32,
    /// 0 means unlimited.
    pub max_header_list_size: u32,
    pub header_table_size: u32,
    /// Target for the connection-level receive window; replenished whenever
    /// consumption dips below half of it.
    pub connection_window: i64,
    pub ping_interval: Duration,
    /// `None` disables the per-request timer.
    pub request_deadline: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: crate::settings::DEFAULT_MAX_FRAME_SIZE,
            initial_window_size: crate::settings::DEFAULT_INITIAL_WINDOW_SIZE,
            max_concurrent_streams: crate::settings::DEFAULT_MAX_CONCURRENT_STREAMS,
            max_header_list_size: 0,
            header_table_size: crate::settings::DEFAULT_HEADER_TABLE_SIZE,
            connection_window: 1024 * 1024,
            ping_interval: Duration::from_secs(3),
            request_deadline: Some(Duration::from_secs(60)),
        }
    }
}

impl ConnectionConfig {
    pub(crate) fn to_settings(&self) -> Settings {
        let mut settings = Settings::advertised();
        settings[SettingsParameter::HeaderTableSize] = self.header_table_size;
        settings[SettingsParameter::InitialWindowSize] = self.initial_window_size;
        settings[SettingsParameter::MaxFrameSize] = self.max_frame_size;
        settings[SettingsParameter::MaxConcurrentStreams] = self.max_concurrent_streams;
        settings[SettingsParameter::MaxHeaderListSize] = self.max_header_list_size;
        settings
    }
}

/// The role-neutral three-quarters of a dispatcher: HPACK tables, stream
/// map, settings records, flow-control accounting, frame emission. The
/// client and server dispatchers wrap this and add their role's behavior.
pub(crate) struct DispatcherCore {
    pub config: ConnectionConfig,
    pub remote_settings: Settings,
    pub shared: Arc<Shared>,
    pub writes: mpsc::Sender<Frame>,
    pub encoder: hpack::Encoder,
    pub decoder: hpack::Decoder,
    pub streams: StreamCoordinator,
    pub conn_recv_window: i64,
}

impl DispatcherCore {
    pub fn new(
        config: ConnectionConfig,
        shared: Arc<Shared>,
        writes: mpsc::Sender<Frame>,
    ) -> Self {
        let remote_settings = Settings::default();
        let mut decoder = hpack::Decoder::with_size(config.header_table_size as usize);
        decoder.set_size_limit(config.header_table_size as usize);
        Self {
            encoder: hpack::Encoder::default(),
            decoder,
            streams: StreamCoordinator::new(
                i64::from(remote_settings[SettingsParameter::InitialWindowSize]),
                i64::from(config.initial_window_size),
            ),
            remote_settings,
            conn_recv_window: i64::from(crate::settings::DEFAULT_INITIAL_WINDOW_SIZE),
            config,
            shared,
            writes,
        }
    }

    pub async fn send(&self, frame: Frame) -> Result<(), H2Error> {
        self.writes.send(frame).await.map_err(|_| writer_gone())
    }

    pub async fn send_window_update(
        &self,
        stream: StreamId,
        increment: u32,
    ) -> Result<(), H2Error> {
        let Some(increment) = std::num::NonZeroU32::new(increment) else {
            return Ok(());
        };
        self.send(Frame::WindowUpdate { stream, increment }).await
    }

    /// The connection window starts at the RFC's 65,535; advertise our real
    /// target right away.
    pub async fn grow_connection_window(&mut self) -> Result<(), H2Error> {
        let initial = i64::from(crate::settings::DEFAULT_INITIAL_WINDOW_SIZE);
        if self.config.connection_window > initial {
            let increment = (self.config.connection_window - initial) as u32;
            self.conn_recv_window = self.config.connection_window;
            self.send_window_update(0, increment).await?;
        }
        Ok(())
    }

    /// Receive-side accounting for a DATA payload against the connection
    /// window, replenishing below the half-way mark.
    pub async fn account_connection_recv(&mut self, len: usize) -> Result<(), H2Error> {
        self.conn_recv_window -= len as i64;
        if self.conn_recv_window < 0 {
            return Err(H2Error::connection(
                ErrorType::FlowControlError,
                "peer overran the connection receive window",
            ));
        }
        if self.conn_recv_window < self.config.connection_window / 2 {
            let increment = (self.config.connection_window - self.conn_recv_window) as u32;
            self.conn_recv_window = self.config.connection_window;
            self.send_window_update(0, increment).await?;
        }
        Ok(())
    }

    /// Applies a peer SETTINGS frame and acknowledges it. Window deltas are
    /// propagated to every live stream; a shrunk HEADER_TABLE_SIZE resizes
    /// the encoder.
    pub async fn apply_remote_settings(
        &mut self,
        params: &[(SettingsParameter, u32)],
    ) -> Result<(), H2Error> {
        let delta = self.remote_settings.apply(params)?;
        self.streams.initial_send_window =
            i64::from(self.remote_settings[SettingsParameter::InitialWindowSize]);
        if delta.initial_window_delta != 0 {
            self.streams
                .apply_initial_window_delta(delta.initial_window_delta)?;
        }
        if let Some(size) = delta.header_table_size {
            self.encoder.set_max_size(size as usize);
        }
        self.shared.remote_max_concurrent.store(
            self.remote_settings[SettingsParameter::MaxConcurrentStreams],
            Ordering::SeqCst,
        );
        self.send(Settings::ack_frame()).await?;
        self.pump_all().await
    }

    /// Decodes the accumulated header block for `id` once END_HEADERS lands,
    /// appending the fields to the stream (trailers land in the same list).
    pub fn decode_header_block(&mut self, id: NonZeroStreamId) -> Result<(), H2Error> {
        let block = {
            let Some(stream) = self.streams.get_mut(id) else {
                return Ok(());
            };
            stream.headers_buffer.split().freeze()
        };
        let fields = self
            .decoder
            .decode(&block)
            .map_err(|err| H2Error::connection(ErrorType::CompressionError, err.to_string()))?;
        let list_size: usize = fields.iter().map(hpack::HeaderField::size).sum();
        let limit = self.config.max_header_list_size as usize;
        if limit != 0 && list_size > limit {
            return Err(H2Error::stream(id, ErrorType::RefusedStream));
        }
        let stream = self.streams.get_mut(id).expect("live stream");
        stream.fields.extend(fields);
        stream.headers_done = true;
        Ok(())
    }

    /// Decodes and discards a header block that belongs to no stream (e.g.
    /// a refused one); the dynamic table must stay in sync regardless.
    pub fn decode_discarded_block(&mut self, block: &[u8]) -> Result<(), H2Error> {
        self.decoder
            .decode(block)
            .map(|_| ())
            .map_err(|err| H2Error::connection(ErrorType::CompressionError, err.to_string()))
    }

    /// Emits one header list as HEADERS plus as many CONTINUATIONs as the
    /// peer's MAX_FRAME_SIZE demands.
    pub async fn send_header_block(
        &mut self,
        id: NonZeroStreamId,
        fields: Vec<(Bytes, Bytes)>,
        end_stream: bool,
    ) -> Result<(), H2Error> {
        let mut fragment = self.encoder.encode(fields);
        let max = self.remote_settings[SettingsParameter::MaxFrameSize] as usize;
        let mut flags = if end_stream {
            HeadersFlags::END_STREAM
        } else {
            HeadersFlags::empty()
        };
        if fragment.len() <= max {
            flags |= HeadersFlags::END_HEADERS;
            return self
                .send(Frame::Headers {
                    stream: id,
                    flags,
                    dependency: 0,
                    exclusive_dependency: false,
                    weight: 0,
                    fragment,
                })
                .await;
        }
        let first = fragment.split_to(max);
        self.send(Frame::Headers {
            stream: id,
            flags,
            dependency: 0,
            exclusive_dependency: false,
            weight: 0,
            fragment: first,
        })
        .await?;
        while fragment.len() > max {
            let chunk = fragment.split_to(max);
            self.send(Frame::Continuation {
                stream: id,
                flags: ContinuationFlags::empty(),
                fragment: chunk,
            })
            .await?;
        }
        self.send(Frame::Continuation {
            stream: id,
            flags: ContinuationFlags::END_HEADERS,
            fragment,
        })
        .await
    }

    /// Moves parked outbound body bytes for one stream, bounded by
    /// min(peer MAX_FRAME_SIZE, stream send window, connection send window).
    /// Bytes that do not fit stay parked until a WINDOW_UPDATE nudges us.
    pub async fn pump_stream(&mut self, id: NonZeroStreamId) -> Result<(), H2Error> {
        let max_frame = i64::from(self.remote_settings[SettingsParameter::MaxFrameSize]);
        loop {
            let step = {
                let Some(stream) = self.streams.get_mut(id) else {
                    return Ok(());
                };
                if stream.end_sent {
                    break;
                }
                if stream.pending_send.is_empty() {
                    if !stream.send_done || stream.end_sent {
                        break;
                    }
                    stream.transition(false, StreamEvent::Data { end_stream: true })?;
                    stream.end_sent = true;
                    Some((
                        Frame::Data {
                            stream: id,
                            flags: DataFlags::END_STREAM,
                            data: Bytes::new(),
                        },
                        stream.is_closed(),
                        true,
                    ))
                } else {
                    let conn_window = self.shared.send_window.load(Ordering::SeqCst);
                    let budget = max_frame
                        .min(stream.send_window)
                        .min(conn_window)
                        .min(stream.pending_send.len() as i64);
                    if budget <= 0 {
                        None
                    } else {
                        let chunk = stream.pending_send.split_to(budget as usize).freeze();
                        stream.send_window -= budget;
                        self.shared.send_window.fetch_sub(budget, Ordering::SeqCst);
                        let end_stream = stream.pending_send.is_empty() && stream.send_done;
                        stream.transition(false, StreamEvent::Data { end_stream })?;
                        if end_stream {
                            stream.end_sent = true;
                        }
                        Some((
                            Frame::Data {
                                stream: id,
                                flags: if end_stream {
                                    DataFlags::END_STREAM
                                } else {
                                    DataFlags::empty()
                                },
                                data: chunk,
                            },
                            end_stream && stream.is_closed(),
                            end_stream,
                        ))
                    }
                }
            };
            let Some((frame, fully_closed, done)) = step else {
                break;
            };
            self.send(frame).await?;
            if fully_closed {
                self.close_stream(id);
            }
            if done {
                break;
            }
        }
        // re-open the gate for a streaming producer once we are under water
        if let Some(stream) = self.streams.get_mut(id) {
            if let Some(writable) = &stream.writable {
                writable
                    .send(stream.pending_send.len() < WRITABLE_HIGH_WATER)
                    .ok();
            }
        }
        Ok(())
    }

    pub async fn pump_all(&mut self) -> Result<(), H2Error> {
        for id in self.streams.ids() {
            self.pump_stream(id).await?;
        }
        Ok(())
    }

    pub fn close_stream(&mut self, id: NonZeroStreamId) {
        self.streams.close(id);
        self.shared
            .open_streams
            .store(self.streams.open_count() as u32, Ordering::SeqCst);
    }

    pub fn sync_open_streams(&self) {
        self.shared
            .open_streams
            .store(self.streams.open_count() as u32, Ordering::SeqCst);
    }

    /// Terminal failure: GOAWAY for protocol-level errors, then mark closed.
    pub async fn fail_connection(&mut self, err: &H2Error) {
        if let H2Error::Connection { error, reason } = err {
            error!("connection error {error:?}: {reason}");
            self.send(Frame::GoAway {
                last_stream: self.streams.last_peer_stream_id,
                error: *error,
                debug: Bytes::copy_from_slice(reason.as_bytes()),
            })
            .await
            .ok();
        } else {
            debug!("connection failed: {err}");
        }
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

/// A live client connection multiplexing requests onto one byte stream.
/// Cheap to clone; clones share the underlying connection.
#[derive(Debug, Clone)]
pub struct Connection {
    events: mpsc::Sender<Event>,
    shared: Arc<Shared>,
}

impl Connection {
    /// Runs the client handshake over an already-negotiated `h2` byte
    /// stream and spawns the connection's tasks.
    pub async fn handshake<IO>(io: IO, config: ConnectionConfig) -> Result<Self, ClientError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, mut writer) = tokio::io::split(io);

        // client connection preface, then our settings
        writer.write_all(PREFACE).await?;
        config.to_settings().to_frame().write_into(&mut writer).await?;
        writer.flush().await?;

        let shared = Arc::new(Shared::new());
        let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
        let (write_tx, write_rx) = mpsc::channel(QUEUE_DEPTH);

        let reader_handle = tokio::spawn(reader_task(
            reader,
            shared.clone(),
            event_tx.clone(),
            write_tx.clone(),
            config.max_frame_size,
        ));
        tokio::spawn(writer_task(
            writer,
            shared.clone(),
            write_rx,
            event_tx.clone(),
            config.ping_interval,
        ));

        let dispatcher = ClientDispatcher {
            core: DispatcherCore::new(config, shared.clone(), write_tx),
            continuing: None,
            deadlines: BinaryHeap::new(),
            draining: false,
        };
        tokio::spawn(async move {
            dispatcher.run(event_rx).await;
            // unblock the reader; the writer drains its queue and exits
            reader_handle.abort();
        });

        Ok(Self {
            events: event_tx,
            shared,
        })
    }

    /// Dials `url`, negotiates `h2` over TLS, and performs the handshake.
    pub async fn connect(
        url: &Url,
        tls: Arc<rustls::ClientConfig>,
        config: ConnectionConfig,
    ) -> Result<Self, ClientError> {
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::Url("missing host".to_owned()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ClientError::Url("missing port".to_owned()))?;
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true).ok();
        let server_name = rustls::ServerName::try_from(host)
            .map_err(|_| ClientError::Url(format!("{host} is not a valid TLS server name")))?;
        let stream = TlsConnector::from(tls).connect(server_name, tcp).await?;
        match stream.get_ref().1.alpn_protocol() {
            Some(b"h2") => {}
            _ => return Err(ClientError::AlpnRejected),
        }
        Self::handshake(stream, config).await
    }

    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        if self.is_closed() {
            return Err(ClientError::ConnectionClosed);
        }
        let (response_tx, response_rx) = oneshot::channel();
        self.events
            .send(Event::Request {
                request,
                response_tx,
            })
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        response_rx
            .await
            .map_err(|_| ClientError::ConnectionClosed)?
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> u32 {
        self.shared.open_streams.load(Ordering::SeqCst)
    }

    /// Room for another request stream under the peer's concurrency cap.
    pub fn has_capacity(&self) -> bool {
        !self.is_closed()
            && self.open_streams() < self.shared.remote_max_concurrent.load(Ordering::SeqCst)
    }

    /// Graceful close: GOAWAY, then drain in-flight requests.
    pub async fn shutdown(&self) {
        self.events.send(Event::Shutdown).await.ok();
    }
}

struct ClientDispatcher {
    core: DispatcherCore,
    /// Stream whose header block is mid-flight; until END_HEADERS only its
    /// CONTINUATION frames are admissible, connection-wide.
    continuing: Option<NonZeroStreamId>,
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,
    draining: bool,
}

impl ClientDispatcher {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        if let Err(err) = self.core.grow_connection_window().await {
            self.core.fail_connection(&err).await;
            return;
        }
        loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);
            let event = tokio::select! {
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => event,
                    None => break,
                },
                _ = sleep_until(next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))),
                    if next_deadline.is_some() =>
                {
                    if let Err(err) = self.expire_deadlines().await {
                        self.core.fail_connection(&err).await;
                        break;
                    }
                    continue;
                }
            };
            match self.handle_event(event).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    self.core.fail_connection(&err).await;
                    break;
                }
            }
            if self.draining && self.core.streams.open_count() == 0 {
                break;
            }
        }
        self.core.shared.closed.store(true, Ordering::SeqCst);
        for id in self.core.streams.ids() {
            if let Some(stream) = self.core.streams.get_mut(id) {
                stream.resolve(Err(ClientError::ConnectionClosed));
            }
        }
    }

    /// Returns Ok(false) when the connection is done.
    async fn handle_event(&mut self, event: Event) -> Result<bool, H2Error> {
        match event {
            Event::Frame(frame) => {
                if let Err(err) = self.handle_frame(frame).await {
                    match err {
                        H2Error::Stream { stream, error } => {
                            self.reset_stream(stream, error).await?;
                        }
                        fatal => return Err(fatal),
                    }
                }
            }
            Event::WindowNudge => self.core.pump_all().await?,
            Event::Request {
                request,
                response_tx,
            } => {
                if self.draining || self.core.shared.closed.load(Ordering::SeqCst) {
                    response_tx.send(Err(ClientError::ConnectionClosed)).ok();
                } else {
                    self.start_request(request, response_tx).await?;
                }
            }
            Event::PeerGoaway {
                last_stream,
                error,
                debug,
            } => {
                self.draining = true;
                for id in self.core.streams.ids() {
                    if id.get() > last_stream {
                        if let Some(stream) = self.core.streams.get_mut(id) {
                            stream.resolve(Err(if error == ErrorType::NoError {
                                ClientError::ConnectionClosed
                            } else {
                                ClientError::GoAway {
                                    error,
                                    debug: debug.clone(),
                                }
                            }));
                        }
                        self.core.close_stream(id);
                    }
                }
                if error != ErrorType::NoError {
                    return Ok(false);
                }
            }
            Event::PingTimeout => {
                for id in self.core.streams.ids() {
                    if let Some(stream) = self.core.streams.get_mut(id) {
                        stream.resolve(Err(ClientError::Timeout));
                    }
                    self.core.close_stream(id);
                }
                return Ok(false);
            }
            Event::ConnectionError(err) => return Err(err),
            Event::Shutdown => {
                if !self.draining {
                    self.draining = true;
                    // we never accept pushed streams, so none of the peer's are open
                    self.core
                        .send(Frame::GoAway {
                            last_stream: 0,
                            error: ErrorType::NoError,
                            debug: Bytes::new(),
                        })
                        .await?;
                }
            }
            Event::Response { .. }
            | Event::HandlerFailed { .. }
            | Event::BodyChunk { .. }
            | Event::BodyEnd { .. } => {
                debug!("server-role event on a client connection; dropped");
            }
        }
        Ok(true)
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        if let Some(expected) = self.continuing {
            match &frame {
                Frame::Continuation { stream, .. } if *stream == expected => {}
                _ => {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "header block interleaved with another frame",
                    ));
                }
            }
        }
        match frame {
            Frame::Settings { flags, params } => {
                if flags.contains(SettingsFlags::ACK) {
                    trace!("settings acknowledged");
                    return Ok(());
                }
                self.core.apply_remote_settings(&params).await?;
            }
            Frame::Headers {
                stream: id,
                flags,
                dependency,
                exclusive_dependency,
                weight,
                fragment,
            } => {
                if self.core.streams.get_mut(id).is_none() {
                    if self.core.streams.was_recently_closed(id) {
                        return Err(H2Error::connection(
                            ErrorType::StreamClosed,
                            "HEADERS on a closed stream",
                        ));
                    }
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "HEADERS on a stream this client never opened",
                    ));
                }
                let stream = self.core.streams.get_mut(id).expect("stream looked up above");
                if flags.contains(HeadersFlags::PRIORITY) {
                    stream.note_priority(dependency, exclusive_dependency, weight);
                }
                stream.transition(
                    true,
                    StreamEvent::Headers {
                        end_stream: flags.contains(HeadersFlags::END_STREAM),
                    },
                )?;
                stream.end_stream_seen |= flags.contains(HeadersFlags::END_STREAM);
                stream.headers_buffer.extend_from_slice(&fragment);
                if flags.contains(HeadersFlags::END_HEADERS) {
                    self.finish_header_block(id)?;
                } else {
                    self.continuing = Some(id);
                }
            }
            Frame::Continuation {
                stream: id,
                flags,
                fragment,
            } => {
                if self.continuing != Some(id) {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "CONTINUATION without an open header block",
                    ));
                }
                let stream = self.core.streams.get_mut(id).ok_or_else(|| {
                    H2Error::connection(ErrorType::ProtocolError, "CONTINUATION on no stream")
                })?;
                stream.headers_buffer.extend_from_slice(&fragment);
                if flags.contains(ContinuationFlags::END_HEADERS) {
                    self.continuing = None;
                    self.finish_header_block(id)?;
                }
            }
            Frame::Data {
                stream: id,
                flags,
                data,
            } => {
                self.core.account_connection_recv(data.len()).await?;
                if self.core.streams.get_mut(id).is_none() {
                    if self.core.streams.was_recently_closed(id) {
                        return Err(H2Error::connection(
                            ErrorType::StreamClosed,
                            "DATA on a closed stream",
                        ));
                    }
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "DATA on a stream this client never opened",
                    ));
                }
                let end_stream = flags.contains(DataFlags::END_STREAM);
                let initial_recv = self.core.streams.initial_recv_window;
                let stream = self.core.streams.get_mut(id).expect("stream looked up above");
                if !stream.headers_done {
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "DATA before the response header block",
                    ));
                }
                stream.transition(true, StreamEvent::Data { end_stream })?;
                stream.consume_recv_window(data.len())?;
                stream.body.extend_from_slice(&data);
                let replenish = if end_stream {
                    None
                } else {
                    stream.replenish_recv_window(initial_recv)
                };
                if let Some(increment) = replenish {
                    self.core.send_window_update(id.get(), increment).await?;
                }
                if end_stream {
                    self.finish_response(id);
                }
            }
            Frame::ResetStream { stream: id, error } => {
                if self.core.streams.get_mut(id).is_none() {
                    if self.core.streams.was_recently_closed(id) {
                        return Ok(());
                    }
                    return Err(H2Error::connection(
                        ErrorType::ProtocolError,
                        "RST_STREAM on an idle stream",
                    ));
                }
                let stream = self.core.streams.get_mut(id).expect("stream looked up above");
                stream.transition(true, StreamEvent::Reset)?;
                warn!("stream {id} reset by peer: {error:?}");
                stream.resolve(Err(match error {
                    ErrorType::RefusedStream => ClientError::Refused,
                    other => ClientError::Reset(other),
                }));
                self.core.close_stream(id);
            }
            Frame::WindowUpdate {
                stream: id,
                increment,
            } => {
                // stream 0 is credited by the reader; only stream-level here
                let Some(id) = NonZeroStreamId::new(id) else {
                    return Ok(());
                };
                if let Some(stream) = self.core.streams.get_mut(id) {
                    stream.transition(true, StreamEvent::WindowUpdate)?;
                    stream.add_send_window(increment.get())?;
                    self.core.pump_stream(id).await?;
                }
            }
            Frame::Priority {
                stream: id,
                dependency,
                exclusive_dependency,
                weight,
            } => {
                if let Some(stream) = self.core.streams.get_mut(id) {
                    stream.note_priority(dependency, exclusive_dependency, weight);
                }
            }
            Frame::PushPromise { .. } => {
                return Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    "PUSH_PROMISE with ENABLE_PUSH=0",
                ));
            }
            Frame::Ping { .. } | Frame::GoAway { .. } => {
                debug!("connection-scoped frame leaked past the reader");
            }
        }
        Ok(())
    }

    async fn start_request(
        &mut self,
        mut request: Request,
        response_tx: oneshot::Sender<Result<Response, ClientError>>,
    ) -> Result<(), H2Error> {
        if request.user_agent.is_none() {
            request.user_agent = Some(concat!("h2kit/", env!("CARGO_PKG_VERSION")).to_owned());
        }
        let body = request.body.clone();
        let end_stream = body.is_empty();
        let fields = request.to_field_list();

        let id = {
            let stream = self.core.streams.open_local()?;
            stream.response_tx = Some(response_tx);
            stream.transition(false, StreamEvent::Headers { end_stream })?;
            if end_stream {
                stream.end_sent = true;
            } else {
                stream.pending_send.extend_from_slice(&body);
                stream.send_done = true;
            }
            stream.id
        };
        self.core.sync_open_streams();
        trace!("request {} {} on stream {id}", request.method, request.path);

        self.core.send_header_block(id, fields, end_stream).await?;
        if let Some(deadline) = self.core.config.request_deadline {
            self.deadlines
                .push(Reverse((Instant::now() + deadline, id.get())));
        }
        self.core.pump_stream(id).await
    }

    fn finish_header_block(&mut self, id: NonZeroStreamId) -> Result<(), H2Error> {
        self.core.decode_header_block(id)?;
        let ended = self
            .core
            .streams
            .get_mut(id)
            .is_some_and(|stream| stream.end_stream_seen);
        if ended {
            self.finish_response(id);
        }
        Ok(())
    }

    fn finish_response(&mut self, id: NonZeroStreamId) {
        if let Some(stream) = self.core.streams.get_mut(id) {
            trace!(
                "response on stream {id} after {:?}",
                stream.started_at.elapsed()
            );
            let body = stream.body.split().freeze();
            let result = Response::from_fields(&stream.fields, body)
                .map_err(|error| ClientError::Protocol(H2Error::stream(id, error)));
            stream.resolve(result);
            if stream.is_closed() {
                self.core.close_stream(id);
            }
        }
    }

    async fn expire_deadlines(&mut self) -> Result<(), H2Error> {
        let now = Instant::now();
        while let Some(Reverse((at, id))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(id) = NonZeroStreamId::new(id) else { continue };
            if let Some(stream) = self.core.streams.get_mut(id) {
                debug!("request on stream {id} hit its deadline");
                stream.resolve(Err(ClientError::RequestCanceled));
                self.core
                    .send(Frame::ResetStream {
                        stream: id,
                        error: ErrorType::Cancel,
                    })
                    .await?;
                self.core.close_stream(id);
            }
        }
        Ok(())
    }

    async fn reset_stream(&mut self, id: NonZeroStreamId, error: ErrorType) -> Result<(), H2Error> {
        self.core
            .send(Frame::ResetStream { stream: id, error })
            .await?;
        if let Some(stream) = self.core.streams.get_mut(id) {
            stream.transition(false, StreamEvent::Reset).ok();
            stream.resolve(Err(ClientError::Protocol(H2Error::stream(id, error))));
        }
        self.core.close_stream(id);
        Ok(())
    }
}
