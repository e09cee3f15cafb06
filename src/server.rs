//! Server-side connection engine: preface verification, settings exchange,
//! stream admission, handler dispatch, response emission under flow
//! control, and graceful GOAWAY. TLS termination and the accept loop live
//! with the caller; `serve` takes any byte stream whose ALPN came out `h2`.

use crate::{
    connection::{
        reader_task, writer_task, ConnectionConfig, DispatcherCore, Event, Shared, PREFACE,
        QUEUE_DEPTH, WRITABLE_HIGH_WATER,
    },
    enums::*,
    flags::*,
    frame::Frame,
    handler::{DispatchPolicy, Handler},
    request::Request,
    response::{Body, Response},
    stream::StreamEvent,
    stream_coordinator::Admission,
    types::*,
};
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::{mpsc, watch},
    time::{sleep_until, Duration, Instant},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub connection: ConnectionConfig,
    pub dispatch: DispatchPolicy,
    /// How long open streams get to finish after a graceful shutdown begins.
    pub graceful_deadline: Duration,
    /// Flip to `true` to begin a graceful GOAWAY; see `shutdown_handle`.
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            dispatch: DispatchPolicy::default(),
            graceful_deadline: Duration::from_secs(10),
            shutdown: None,
        }
    }
}

impl ServerConfig {
    /// Wires up a shutdown trigger; send `true` on it to drain and close.
    pub fn shutdown_handle(&mut self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(rx);
        tx
    }
}

/// Serves one connection to completion. Returns once the peer hangs up,
/// the keepalive declares it dead, a connection error tears it down, or a
/// graceful shutdown drains it.
pub async fn serve<IO>(
    io: IO,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let ServerConfig {
        connection: conn_config,
        dispatch,
        graceful_deadline,
        shutdown,
    } = config;
    let (mut reader, mut writer) = tokio::io::split(io);

    // the client speaks first: the 24-byte preface
    let mut preface = [0_u8; 24];
    reader.read_exact(&mut preface).await?;
    if &preface != PREFACE {
        return Err(H2Error::connection(
            ErrorType::ProtocolError,
            "bad connection preface",
        ));
    }
    conn_config
        .to_settings()
        .to_frame()
        .write_into(&mut writer)
        .await?;
    tokio::io::AsyncWriteExt::flush(&mut writer).await?;

    let shared = Arc::new(Shared::new());
    let (event_tx, event_rx) = mpsc::channel(QUEUE_DEPTH);
    let (write_tx, write_rx) = mpsc::channel(QUEUE_DEPTH);
    let reader_handle = tokio::spawn(reader_task(
        reader,
        shared.clone(),
        event_tx.clone(),
        write_tx.clone(),
        conn_config.max_frame_size,
    ));
    let writer_handle = tokio::spawn(writer_task(
        writer,
        shared.clone(),
        write_rx,
        event_tx.clone(),
        conn_config.ping_interval,
    ));

    let dispatcher = ServerDispatcher {
        core: DispatcherCore::new(conn_config, shared, write_tx),
        handler,
        dispatch,
        events_tx: event_tx,
        continuing: None,
        deadlines: BinaryHeap::new(),
        draining: false,
        drain_deadline: None,
        shutdown,
        graceful_deadline,
    };
    let result = dispatcher.run(event_rx).await;
    reader_handle.abort();
    // let the writer flush whatever is queued (a final GOAWAY, usually)
    writer_handle.await.ok();
    result
}

/// A header block in progress, locking out every other frame until
/// END_HEADERS.
enum Continuing {
    Stream(NonZeroStreamId),
    /// Stream was refused, but the block still has to run through the
    /// decoder to keep the dynamic table in sync with the peer.
    Refused(NonZeroStreamId, BytesMut),
}

struct ServerDispatcher {
    core: DispatcherCore,
    handler: Arc<dyn Handler>,
    dispatch: DispatchPolicy,
    events_tx: mpsc::Sender<Event>,
    continuing: Option<Continuing>,
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,
    draining: bool,
    drain_deadline: Option<Instant>,
    shutdown: Option<watch::Receiver<bool>>,
    graceful_deadline: Duration,
}

enum Wake {
    Event(Option<Event>),
    Timer,
    Shutdown,
}

async fn shutdown_signal(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(receiver) => {
            loop {
                if *receiver.borrow() {
                    return;
                }
                if receiver.changed().await.is_err() {
                    break;
                }
            }
            std::future::pending().await
        }
        None => std::future::pending().await,
    }
}

impl ServerDispatcher {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) -> Result<(), H2Error> {
        if let Err(err) = self.core.grow_connection_window().await {
            self.core.fail_connection(&err).await;
            return Err(err);
        }
        let result = loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);
            let wake_at = match (next_deadline, self.drain_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (timer, drain) => timer.or(drain),
            };
            let wake = tokio::select! {
                maybe_event = events.recv() => Wake::Event(maybe_event),
                _ = sleep_until(wake_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))),
                    if wake_at.is_some() => Wake::Timer,
                _ = shutdown_signal(&mut self.shutdown), if !self.draining => Wake::Shutdown,
            };
            match wake {
                Wake::Event(None) => break Ok(()),
                Wake::Event(Some(event)) => match self.handle_event(event).await {
                    Ok(true) => {}
                    Ok(false) => break Ok(()),
                    Err(err) => {
                        self.core.fail_connection(&err).await;
                        break Err(err);
                    }
                },
                Wake::Timer => {
                    if self
                        .drain_deadline
                        .is_some_and(|deadline| Instant::now() >= deadline)
                    {
                        debug!("graceful shutdown deadline; closing");
                        break Ok(());
                    }
                    if let Err(err) = self.expire_deadlines().await {
                        self.core.fail_connection(&err).await;
                        break Err(err);
                    }
                }
                Wake::Shutdown => {
                    if let Err(err) = self.begin_drain().await {
                        self.core.fail_connection(&err).await;
                        break Err(err);
                    }
                }
            }
            if self.draining && self.core.streams.open_count() == 0 {
                break Ok(());
            }
        };
        self.core.shared.closed.store(true, Ordering::SeqCst);
        result
    }

    async fn begin_drain(&mut self) -> Result<(), H2Error> {
        self.draining = true;
        self.drain_deadline = Some(Instant::now() + self.graceful_deadline);
        debug!(
            "graceful shutdown: GOAWAY after stream {}",
            self.core.streams.last_peer_stream_id
        );
        self.core
            .send(Frame::GoAway {
                last_stream: self.core.streams.last_peer_stream_id,
                error: ErrorType::NoError,
                debug: Bytes::new(),
            })
            .await
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
            Event::Response { stream, response } => {
                if let Err(err) = self.start_response(stream, response).await {
                    match err {
                        H2Error::Stream { stream, error } => {
                            self.reset_stream(stream, error).await?;
                        }
                        fatal => return Err(fatal),
                    }
                }
            }
            Event::HandlerFailed { stream } => {
                self.reset_stream(stream, ErrorType::InternalError).await?;
            }
            Event::BodyChunk { stream: id, data } => {
                if let Some(stream) = self.core.streams.get_mut(id) {
                    stream.pending_send.extend_from_slice(&data);
                    if stream.pending_send.len() >= WRITABLE_HIGH_WATER {
                        if let Some(writable) = &stream.writable {
                            writable.send(false).ok();
                        }
                    }
                    self.core.pump_stream(id).await?;
                }
            }
            Event::BodyEnd { stream: id } => {
                if let Some(stream) = self.core.streams.get_mut(id) {
                    stream.send_done = true;
                    self.core.pump_stream(id).await?;
                }
            }
            Event::PeerGoaway { error, .. } => {
                self.draining = true;
                if error != ErrorType::NoError {
                    return Ok(false);
                }
            }
            Event::PingTimeout => return Ok(false),
            Event::ConnectionError(err) => return Err(err),
            Event::Request { response_tx, .. } => {
                drop(response_tx);
                debug!("client-role event on a server connection; dropped");
            }
            Event::Shutdown => {
                self.begin_drain().await?;
            }
        }
        Ok(true)
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        // a header block in progress locks out every other frame
        let refused_block = match (&frame, &mut self.continuing) {
            (_, None) => None,
            (Frame::Continuation { stream, .. }, Some(Continuing::Stream(expected)))
                if stream == expected =>
            {
                None
            }
            (
                Frame::Continuation {
                    stream,
                    flags,
                    fragment,
                },
                Some(Continuing::Refused(expected, buffer)),
            ) if stream == expected => {
                buffer.extend_from_slice(fragment);
                if flags.contains(ContinuationFlags::END_HEADERS) {
                    Some(std::mem::take(buffer))
                } else {
                    return Ok(());
                }
            }
            _ => {
                return Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    "header block interleaved with another frame",
                ));
            }
        };
        if let Some(block) = refused_block {
            self.continuing = None;
            return self.core.decode_discarded_block(&block);
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
                    if self.draining {
                        return self.refuse_stream(id, &flags, fragment).await;
                    }
                    let max_concurrent = self.core.config.max_concurrent_streams;
                    let refused = matches!(
                        self.core.streams.open_remote(id, max_concurrent)?,
                        Admission::Refused
                    );
                    if refused {
                        return self.refuse_stream(id, &flags, fragment).await;
                    }
                    self.core
                        .shared
                        .last_peer_stream_id
                        .store(id.get(), Ordering::SeqCst);
                    self.core.sync_open_streams();
                    if let Some(deadline) = self.core.config.request_deadline {
                        self.deadlines
                            .push(Reverse((Instant::now() + deadline, id.get())));
                    }
                }
                let stream = self.core.streams.get_mut(id).expect("stream admitted above");
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
                    self.finish_header_block(id).await?;
                } else {
                    self.continuing = Some(Continuing::Stream(id));
                }
            }
            Frame::Continuation {
                stream: id,
                flags,
                fragment,
            } => {
                if !matches!(self.continuing, Some(Continuing::Stream(expected)) if expected == id)
                {
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
                    self.finish_header_block(id).await?;
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
                        "DATA on an idle stream",
                    ));
                }
                let end_stream = flags.contains(DataFlags::END_STREAM);
                let initial_recv = self.core.streams.initial_recv_window;
                let stream = self.core.streams.get_mut(id).expect("stream looked up above");
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
                    self.finish_request(id).await?;
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
                debug!("stream {id} reset by peer: {error:?}");
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
                    "PUSH_PROMISE from a client",
                ));
            }
            Frame::Ping { .. } | Frame::GoAway { .. } => {
                debug!("connection-scoped frame leaked past the reader");
            }
        }
        Ok(())
    }

    /// Refuses a new stream while keeping the HPACK context in sync: the
    /// reset goes out immediately, the header block still gets decoded.
    async fn refuse_stream(
        &mut self,
        id: NonZeroStreamId,
        flags: &HeadersFlags,
        fragment: Bytes,
    ) -> Result<(), H2Error> {
        self.core
            .send(Frame::ResetStream {
                stream: id,
                error: ErrorType::RefusedStream,
            })
            .await?;
        if flags.contains(HeadersFlags::END_HEADERS) {
            self.core.decode_discarded_block(&fragment)
        } else {
            self.continuing = Some(Continuing::Refused(id, BytesMut::from(&fragment[..])));
            Ok(())
        }
    }

    async fn finish_header_block(&mut self, id: NonZeroStreamId) -> Result<(), H2Error> {
        self.core.decode_header_block(id)?;
        let ended = self
            .core
            .streams
            .get_mut(id)
            .is_some_and(|stream| stream.end_stream_seen);
        if ended {
            self.finish_request(id).await?;
        }
        Ok(())
    }

    /// The request is complete; hand it to the handler per dispatch policy.
    async fn finish_request(&mut self, id: NonZeroStreamId) -> Result<(), H2Error> {
        let request = {
            let Some(stream) = self.core.streams.get_mut(id) else {
                return Ok(());
            };
            if stream.response_started {
                return Ok(());
            }
            stream.response_started = true;
            match Request::from_fields(&stream.fields, stream.body.split().freeze()) {
                Ok(request) => request,
                Err(error) => return Err(H2Error::stream(id, error)),
            }
        };
        trace!("{} {} on stream {id}", request.method, request.path);
        match self.dispatch {
            DispatchPolicy::Inline => {
                let handler = self.handler.clone();
                match catch_unwind(AssertUnwindSafe(move || handler.handle(request))) {
                    Ok(response) => self.start_response(id, response).await?,
                    Err(_) => {
                        warn!("handler panicked on stream {id}");
                        return Err(H2Error::stream(id, ErrorType::InternalError));
                    }
                }
            }
            DispatchPolicy::Worker => {
                let handler = self.handler.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let event =
                        match tokio::task::spawn_blocking(move || handler.handle(request)).await {
                            Ok(response) => Event::Response {
                                stream: id,
                                response,
                            },
                            Err(err) => {
                                warn!("handler panicked on stream {id}: {err}");
                                Event::HandlerFailed { stream: id }
                            }
                        };
                    events.send(event).await.ok();
                });
            }
        }
        Ok(())
    }

    async fn start_response(
        &mut self,
        id: NonZeroStreamId,
        response: Response,
    ) -> Result<(), H2Error> {
        let status = response.status;
        let fields = response.to_field_list();
        enum BodySource {
            Buffered(Bytes),
            Streaming(mpsc::Receiver<Bytes>),
        }
        let (end_stream, body) = match response.body {
            Body::Full(bytes) if bytes.is_empty() => (true, None),
            Body::Full(bytes) => (false, Some(BodySource::Buffered(bytes))),
            Body::Streaming(receiver) => (false, Some(BodySource::Streaming(receiver))),
        };
        {
            let Some(stream) = self.core.streams.get_mut(id) else {
                trace!("response for stream {id} dropped; stream is gone");
                return Ok(());
            };
            trace!(
                "response {status} on stream {id} after {:?}",
                stream.started_at.elapsed()
            );
            stream.transition(false, StreamEvent::Headers { end_stream })?;
            if end_stream {
                stream.end_sent = true;
            }
            match body {
                Some(BodySource::Buffered(bytes)) => {
                    stream.pending_send.extend_from_slice(&bytes);
                    stream.send_done = true;
                }
                Some(BodySource::Streaming(receiver)) => {
                    let (writable_tx, writable_rx) = watch::channel(true);
                    stream.writable = Some(writable_tx);
                    tokio::spawn(body_forwarder(
                        id,
                        receiver,
                        writable_rx,
                        self.events_tx.clone(),
                    ));
                }
                None => {}
            }
        }
        self.core.send_header_block(id, fields, end_stream).await?;
        if end_stream {
            let closed = self
                .core
                .streams
                .get_mut(id)
                .is_some_and(|stream| stream.is_closed());
            if closed {
                self.core.close_stream(id);
            }
            return Ok(());
        }
        self.core.pump_stream(id).await
    }

    async fn expire_deadlines(&mut self) -> Result<(), H2Error> {
        let now = Instant::now();
        while let Some(Reverse((at, id))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            let Some(id) = NonZeroStreamId::new(id) else { continue };
            if self.core.streams.get_mut(id).is_some() {
                debug!("request on stream {id} hit its deadline");
                self.reset_stream(id, ErrorType::Cancel).await?;
            }
        }
        Ok(())
    }

    async fn reset_stream(&mut self, id: NonZeroStreamId, error: ErrorType) -> Result<(), H2Error> {
        warn!("resetting stream {id}: {error:?}");
        self.core
            .send(Frame::ResetStream { stream: id, error })
            .await?;
        if let Some(stream) = self.core.streams.get_mut(id) {
            stream.transition(false, StreamEvent::Reset).ok();
        }
        // dropping the stream drops its writable gate; a body forwarder
        // notices and drains its producer
        self.core.close_stream(id);
        Ok(())
    }
}

/// Bridges a streaming response body into the dispatcher's event queue,
/// honoring the per-stream writable gate for back-pressure.
async fn body_forwarder(
    id: NonZeroStreamId,
    mut body: mpsc::Receiver<Bytes>,
    mut writable: watch::Receiver<bool>,
    events: mpsc::Sender<Event>,
) {
    loop {
        while !*writable.borrow() {
            if writable.changed().await.is_err() {
                // stream reset; unblock the producer
                while body.recv().await.is_some() {}
                return;
            }
        }
        match body.recv().await {
            Some(data) => {
                if events.send(Event::BodyChunk { stream: id, data }).await.is_err() {
                    return;
                }
            }
            None => {
                events.send(Event::BodyEnd { stream: id }).await.ok();
                return;
            }
        }
    }
}
