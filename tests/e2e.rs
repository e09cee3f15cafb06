//! End-to-end tests: the server engine on one end of an in-memory duplex
//! pipe, with either the real client engine or a scripted raw peer on the
//! other.

use bytes::Bytes;
use h2kit::{
    enums::{ErrorType, SettingsParameter},
    flags::{ContinuationFlags, DataFlags, HeadersFlags, SettingsFlags},
    frame::Frame,
    hpack, serve, Connection, ConnectionConfig, DispatchPolicy, Handler, Request, Response,
    ServerConfig, Url,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

fn stream_id(id: u32) -> NonZeroU32 {
    NonZeroU32::new(id).unwrap()
}

fn hello_handler() -> Arc<dyn Handler> {
    Arc::new(|_request: Request| Response::new(200).with_body("Hello"))
}

/// A scripted HTTP/2 client speaking raw frames at a served connection.
struct RawPeer {
    io: DuplexStream,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
}

impl RawPeer {
    async fn start(handler: Arc<dyn Handler>, config: ServerConfig) -> Self {
        let (client_io, server_io) = duplex(1 << 20);
        tokio::spawn(serve(server_io, handler, config));
        let mut peer = Self {
            io: client_io,
            encoder: hpack::Encoder::default(),
            decoder: hpack::Decoder::default(),
        };
        peer.io.write_all(PREFACE).await.unwrap();
        peer.send(Frame::Settings {
            flags: SettingsFlags::empty(),
            params: Vec::new(),
        })
        .await;
        peer
    }

    async fn send(&mut self, frame: Frame) {
        frame.write_into(&mut self.io).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        loop {
            if let Some(frame) = timeout(
                Duration::from_secs(5),
                Frame::read_from(&mut self.io, 16_384),
            )
            .await
            .expect("timed out waiting for a frame")
            .expect("peer read failed")
            {
                return frame;
            }
        }
    }

    /// Next frame that is not connection bookkeeping.
    async fn recv_stream_frame(&mut self) -> Frame {
        loop {
            match self.recv().await {
                Frame::Settings { .. } | Frame::Ping { .. } | Frame::WindowUpdate { .. } => {}
                frame => return frame,
            }
        }
    }

    fn request_fragment(&mut self, path: &'static str, authority: &'static str) -> Bytes {
        self.encoder.encode(vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
            (Bytes::from_static(b":path"), Bytes::from_static(path.as_bytes())),
            (
                Bytes::from_static(b":authority"),
                Bytes::from_static(authority.as_bytes()),
            ),
        ])
    }

    async fn send_request(&mut self, id: u32, end_stream: bool) {
        let fragment = self.request_fragment("/", "example.test");
        let mut flags = HeadersFlags::END_HEADERS;
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        self.send(Frame::Headers {
            stream: stream_id(id),
            flags,
            dependency: 0,
            exclusive_dependency: false,
            weight: 0,
            fragment,
        })
        .await;
    }

    fn decode_status(&mut self, fragment: &Bytes) -> String {
        let fields = self.decoder.decode(fragment).unwrap();
        assert_eq!(fields[0].name.as_ref(), b":status");
        String::from_utf8_lossy(&fields[0].value).into_owned()
    }
}

async fn connect_pair(
    handler: Arc<dyn Handler>,
    server_config: ServerConfig,
    client_config: ConnectionConfig,
) -> Connection {
    let (client_io, server_io) = duplex(1 << 20);
    tokio::spawn(serve(server_io, handler, server_config));
    Connection::handshake(client_io, client_config)
        .await
        .unwrap()
}

fn test_url() -> Url {
    "https://example.test/".try_into().unwrap()
}

// ===== scenario 1: simple GET =====

#[tokio::test]
async fn simple_get_on_the_wire() {
    let mut peer = RawPeer::start(hello_handler(), ServerConfig::default()).await;
    peer.send_request(1, true).await;

    let headers = peer.recv_stream_frame().await;
    let Frame::Headers { stream, flags, fragment, .. } = headers else {
        panic!("expected HEADERS, got {headers:?}");
    };
    assert_eq!(stream.get(), 1);
    assert!(flags.contains(HeadersFlags::END_HEADERS));
    assert!(!flags.contains(HeadersFlags::END_STREAM));
    assert_eq!(peer.decode_status(&fragment), "200");

    let data = peer.recv_stream_frame().await;
    let Frame::Data { stream, flags, data } = data else {
        panic!("expected DATA, got {data:?}");
    };
    assert_eq!(stream.get(), 1);
    assert_eq!(data.as_ref(), b"Hello");
    assert!(flags.contains(DataFlags::END_STREAM));
}

#[tokio::test]
async fn simple_get_through_the_client() {
    let connection = connect_pair(
        hello_handler(),
        ServerConfig::default(),
        ConnectionConfig::default(),
    )
    .await;
    let response = connection.request(Request::get(&test_url())).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "Hello");
}

#[tokio::test]
async fn concurrent_requests_multiplex() {
    let handler: Arc<dyn Handler> = Arc::new(|request: Request| {
        Response::new(200).with_body(format!("echo {}", request.path))
    });
    let connection = connect_pair(
        handler,
        ServerConfig::default(),
        ConnectionConfig::default(),
    )
    .await;
    let base = test_url();
    let mut handles = Vec::new();
    for n in 0..8 {
        let connection = connection.clone();
        let url = base.join(&format!("/item/{n}")).unwrap();
        handles.push(tokio::spawn(async move {
            connection.request(Request::get(&url)).await.unwrap()
        }));
    }
    for (n, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), format!("echo /item/{n}"));
    }
}

#[tokio::test]
async fn post_body_reaches_the_handler() {
    let handler: Arc<dyn Handler> = Arc::new(|request: Request| {
        assert_eq!(request.content_type.as_deref(), Some("text/plain"));
        Response::new(200).with_body(request.body.to_vec())
    });
    let connection = connect_pair(
        handler,
        ServerConfig::default(),
        ConnectionConfig::default(),
    )
    .await;
    let mut request = Request::post(&test_url(), None, "round and round");
    request.content_type = Some("text/plain".to_owned());
    let response = connection.request(request).await.unwrap();
    assert_eq!(response.text(), "round and round");
}

// ===== scenario 2: interleaved CONTINUATION =====

#[tokio::test]
async fn interleaved_header_block_is_a_protocol_error() {
    let mut peer = RawPeer::start(hello_handler(), ServerConfig::default()).await;

    let fragment = peer.request_fragment("/", "example.test");
    peer.send(Frame::Headers {
        stream: stream_id(1),
        flags: HeadersFlags::END_STREAM,
        dependency: 0,
        exclusive_dependency: false,
        weight: 0,
        fragment,
    })
    .await;
    peer.send_request(3, true).await;

    loop {
        match peer.recv().await {
            Frame::GoAway { error, .. } => {
                assert_eq!(error, ErrorType::ProtocolError);
                break;
            }
            Frame::Settings { .. } | Frame::WindowUpdate { .. } => {}
            other => panic!("expected GOAWAY, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn split_header_block_is_reassembled() {
    let mut peer = RawPeer::start(hello_handler(), ServerConfig::default()).await;
    let fragment = peer.request_fragment("/", "example.test");
    let split = fragment.len() / 2;
    peer.send(Frame::Headers {
        stream: stream_id(1),
        flags: HeadersFlags::END_STREAM,
        dependency: 0,
        exclusive_dependency: false,
        weight: 0,
        fragment: fragment.slice(..split),
    })
    .await;
    peer.send(Frame::Continuation {
        stream: stream_id(1),
        flags: ContinuationFlags::END_HEADERS,
        fragment: fragment.slice(split..),
    })
    .await;

    let Frame::Headers { fragment, .. } = peer.recv_stream_frame().await else {
        panic!("expected response HEADERS");
    };
    assert_eq!(peer.decode_status(&fragment), "200");
}

// ===== scenario 3: flow-control sub-window write =====

#[tokio::test]
async fn response_body_respects_the_stream_window() {
    let handler: Arc<dyn Handler> =
        Arc::new(|_request: Request| Response::new(200).with_body(vec![0x42_u8; 25]));
    let mut peer = RawPeer::start(handler, ServerConfig::default()).await;
    // shrink the server's view of new stream send windows to 10 bytes
    peer.send(Frame::Settings {
        flags: SettingsFlags::empty(),
        params: vec![(SettingsParameter::InitialWindowSize, 10)],
    })
    .await;
    // wait for the ack so the stream is created under the new window
    loop {
        if let Frame::Settings { flags, .. } = peer.recv().await {
            if flags.contains(SettingsFlags::ACK) {
                break;
            }
        }
    }

    peer.send_request(1, true).await;
    let Frame::Headers { .. } = peer.recv_stream_frame().await else {
        panic!("expected response HEADERS");
    };
    let Frame::Data { flags, data, .. } = peer.recv_stream_frame().await else {
        panic!("expected first DATA");
    };
    assert_eq!(data.len(), 10, "first chunk fills the 10-byte window");
    assert!(!flags.contains(DataFlags::END_STREAM));

    peer.send(Frame::WindowUpdate {
        stream: 1,
        increment: NonZeroU32::new(25).unwrap(),
    })
    .await;
    let Frame::Data { flags, data, .. } = peer.recv_stream_frame().await else {
        panic!("expected second DATA");
    };
    assert_eq!(data.len(), 15);
    assert!(flags.contains(DataFlags::END_STREAM));
}

// ===== scenario 4: concurrent-streams refusal =====

#[tokio::test]
async fn over_the_stream_cap_is_refused() {
    let handler: Arc<dyn Handler> =
        Arc::new(|_request: Request| Response::new(200).with_body("ok"));
    let mut config = ServerConfig::default();
    config.connection.max_concurrent_streams = 2;
    let mut peer = RawPeer::start(handler, config).await;

    for id in [1_u32, 3, 5] {
        peer.send_request(id, false).await;
    }
    let reset = peer.recv_stream_frame().await;
    let Frame::ResetStream { stream, error } = reset else {
        panic!("expected RST_STREAM, got {reset:?}");
    };
    assert_eq!(stream.get(), 5);
    assert_eq!(error, ErrorType::RefusedStream);

    // streams 1 and 3 complete normally
    for id in [1_u32, 3] {
        peer.send(Frame::Data {
            stream: stream_id(id),
            flags: DataFlags::END_STREAM,
            data: Bytes::new(),
        })
        .await;
    }
    for expected in [1_u32, 3] {
        let Frame::Headers { stream, fragment, .. } = peer.recv_stream_frame().await else {
            panic!("expected response HEADERS");
        };
        assert_eq!(stream.get(), expected);
        assert_eq!(peer.decode_status(&fragment), "200");
        let Frame::Data { stream, .. } = peer.recv_stream_frame().await else {
            panic!("expected response DATA");
        };
        assert_eq!(stream.get(), expected);
    }
}

#[tokio::test]
async fn stream_ids_must_increase() {
    let mut peer = RawPeer::start(hello_handler(), ServerConfig::default()).await;
    peer.send_request(5, true).await;
    let Frame::Headers { .. } = peer.recv_stream_frame().await else {
        panic!("expected response HEADERS");
    };
    peer.send_request(3, true).await;
    loop {
        match peer.recv().await {
            Frame::GoAway { error, .. } => {
                assert_eq!(error, ErrorType::ProtocolError);
                break;
            }
            _ => {}
        }
    }
}

// ===== scenario 5: HPACK dynamic-table reuse =====

#[tokio::test]
async fn repeated_requests_share_the_dynamic_table() {
    let handler: Arc<dyn Handler> = Arc::new(|request: Request| {
        assert_eq!(request.authority, "example.test");
        Response::new(204)
    });
    let mut peer = RawPeer::start(handler, ServerConfig::default()).await;

    let first = peer.request_fragment("/", "example.test");
    let first_len = first.len();
    peer.send(Frame::Headers {
        stream: stream_id(1),
        flags: HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
        dependency: 0,
        exclusive_dependency: false,
        weight: 0,
        fragment: first,
    })
    .await;
    let Frame::Headers { fragment, .. } = peer.recv_stream_frame().await else {
        panic!("expected first response");
    };
    assert_eq!(peer.decode_status(&fragment), "204");

    // the second fragment leans on the dynamic table and shrinks
    let second = peer.request_fragment("/", "example.test");
    assert!(second.len() < first_len);
    peer.send(Frame::Headers {
        stream: stream_id(3),
        flags: HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
        dependency: 0,
        exclusive_dependency: false,
        weight: 0,
        fragment: second,
    })
    .await;
    let Frame::Headers { stream, fragment, .. } = peer.recv_stream_frame().await else {
        panic!("expected second response");
    };
    assert_eq!(stream.get(), 3);
    assert_eq!(peer.decode_status(&fragment), "204");
}

// ===== scenario 6: ping timeout =====

#[tokio::test]
async fn unanswered_pings_close_the_connection() {
    let mut config = ServerConfig::default();
    config.connection.ping_interval = Duration::from_millis(100);
    let mut peer = RawPeer::start(hello_handler(), config).await;

    // answer nothing; after three unacknowledged pings the server goes away
    let goaway = timeout(Duration::from_secs(3), async {
        loop {
            if let Frame::GoAway { error, .. } = peer.recv().await {
                return error;
            }
        }
    })
    .await
    .expect("server never closed the idle connection");
    assert_eq!(goaway, ErrorType::NoError);
}

// ===== protocol edges =====

#[tokio::test]
async fn ping_on_a_stream_is_a_protocol_error() {
    let mut peer = RawPeer::start(hello_handler(), ServerConfig::default()).await;
    // hand-rolled PING with stream id 1; the codec refuses to build one
    let mut raw = Vec::new();
    raw.extend_from_slice(&[0, 0, 8]);
    raw.push(0x6);
    raw.push(0);
    raw.extend_from_slice(&1_u32.to_be_bytes());
    raw.extend_from_slice(&[0; 8]);
    peer.io.write_all(&raw).await.unwrap();

    loop {
        match peer.recv().await {
            Frame::GoAway { error, .. } => {
                assert_eq!(error, ErrorType::ProtocolError);
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn push_promise_is_rejected() {
    let mut peer = RawPeer::start(hello_handler(), ServerConfig::default()).await;
    peer.send(Frame::PushPromise {
        stream: stream_id(1),
        flags: h2kit::flags::PushPromiseFlags::END_HEADERS,
        promised: 2,
        fragment: Bytes::new(),
    })
    .await;
    loop {
        match peer.recv().await {
            Frame::GoAway { error, .. } => {
                assert_eq!(error, ErrorType::ProtocolError);
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn data_on_an_idle_stream_is_a_protocol_error() {
    let mut peer = RawPeer::start(hello_handler(), ServerConfig::default()).await;
    peer.send(Frame::Data {
        stream: stream_id(1),
        flags: DataFlags::empty(),
        data: Bytes::from_static(b"oops"),
    })
    .await;
    loop {
        match peer.recv().await {
            Frame::GoAway { error, .. } => {
                assert_eq!(error, ErrorType::ProtocolError);
                break;
            }
            _ => {}
        }
    }
}

// ===== dispatch, deadlines, streaming, shutdown =====

#[tokio::test]
async fn worker_dispatch_serves_requests() {
    let mut config = ServerConfig::default();
    config.dispatch = DispatchPolicy::Worker;
    let connection = connect_pair(
        hello_handler(),
        config,
        ConnectionConfig::default(),
    )
    .await;
    let response = connection.request(Request::get(&test_url())).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "Hello");
}

#[tokio::test]
async fn handler_panic_resets_the_stream() {
    let handler: Arc<dyn Handler> = Arc::new(|_request: Request| -> Response {
        panic!("handler blew up");
    });
    let mut config = ServerConfig::default();
    config.dispatch = DispatchPolicy::Worker;
    let connection = connect_pair(handler, config, ConnectionConfig::default()).await;
    let err = connection
        .request(Request::get(&test_url()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, h2kit::ClientError::Reset(ErrorType::InternalError)),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn slow_handler_hits_the_client_deadline() {
    let handler: Arc<dyn Handler> = Arc::new(|_request: Request| {
        std::thread::sleep(Duration::from_secs(1));
        Response::new(200)
    });
    let mut server_config = ServerConfig::default();
    server_config.dispatch = DispatchPolicy::Worker;
    let mut client_config = ConnectionConfig::default();
    client_config.request_deadline = Some(Duration::from_millis(100));
    let connection = connect_pair(handler, server_config, client_config).await;
    let err = connection
        .request(Request::get(&test_url()))
        .await
        .unwrap_err();
    assert!(
        matches!(err, h2kit::ClientError::RequestCanceled),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn stalled_request_hits_the_server_deadline() {
    let mut config = ServerConfig::default();
    config.connection.request_deadline = Some(Duration::from_millis(100));
    let mut peer = RawPeer::start(hello_handler(), config).await;
    // open a stream but never finish the request
    peer.send_request(1, false).await;
    let frame = peer.recv_stream_frame().await;
    let Frame::ResetStream { stream, error } = frame else {
        panic!("expected RST_STREAM, got {frame:?}");
    };
    assert_eq!(stream.get(), 1);
    assert_eq!(error, ErrorType::Cancel);
}

#[tokio::test]
async fn streaming_response_arrives_whole() {
    let handler: Arc<dyn Handler> = Arc::new(|_request: Request| {
        let (response, body) = Response::streaming(200);
        tokio::spawn(async move {
            for chunk in [&b"chunk one, "[..], &b"chunk two, "[..], &b"chunk three"[..]] {
                if body.send(Bytes::from_static(chunk)).await.is_err() {
                    return;
                }
            }
        });
        response
    });
    let connection = connect_pair(
        handler,
        ServerConfig::default(),
        ConnectionConfig::default(),
    )
    .await;
    let response = connection.request(Request::get(&test_url())).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "chunk one, chunk two, chunk three");
}

#[tokio::test]
async fn graceful_shutdown_drains_and_closes() {
    let mut config = ServerConfig::default();
    let shutdown = config.shutdown_handle();
    let (client_io, server_io) = duplex(1 << 20);
    let server = tokio::spawn(serve(server_io, hello_handler(), config));
    let connection = Connection::handshake(client_io, ConnectionConfig::default())
        .await
        .unwrap();

    let response = connection.request(Request::get(&test_url())).await.unwrap();
    assert_eq!(response.status, 200);

    shutdown.send(true).unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not drain")
        .unwrap()
        .unwrap();

    // the connection is spent; new requests fail cleanly
    let err = connection
        .request(Request::get(&test_url()))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "unexpected error: {err:?}");
}
