//! End-to-end tests for the connection engine lifecycle: framing over real
//! sockets, admission control, back-pressure, reconnect and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use framewire::{Connection, Handler, NetOptions, TcpClient, TcpServer};

/// Routes engine logs through the test harness, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn server_options() -> NetOptions {
    NetOptions {
        listen_addr: "127.0.0.1:0".into(),
        length_field_width: 2,
        max_frame_len: 1000,
        ..Default::default()
    }
}

/// Echoes every frame back and counts lifecycle events.
struct EchoHandler {
    runs: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Handler for EchoHandler {
    async fn run(&mut self, conn: Arc<Connection>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        while let Ok(payload) = conn.read_frame().await {
            if conn.write_frame(&[&payload]).is_err() {
                break;
            }
        }
    }

    async fn on_close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
struct Counters {
    runs: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Counters {
    fn factory(&self) -> impl Fn() -> EchoHandler + Send + Sync + 'static {
        let counters = self.clone();
        move || EchoHandler {
            runs: counters.runs.clone(),
            closes: counters.closes.clone(),
        }
    }
}

#[tokio::test]
async fn echo_round_trip_over_real_sockets() {
    init_tracing();
    let counters = Counters::default();
    let server = TcpServer::bind(server_options(), counters.factory())
        .await
        .unwrap();
    server.start();

    let config = server_options().validate().unwrap();
    let codec = config.codec();
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

    let frame = codec.encode(&[b"ab", b"cd"]).unwrap();
    assert_eq!(&frame[..], &[0x00, 0x04, b'a', b'b', b'c', b'd']);
    socket.write_all(&frame).await.unwrap();

    let payload = timeout(Duration::from_secs(5), codec.decode(&mut socket))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&payload[..], b"abcd");

    server.close().await;
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_length_frame_is_data_not_close() {
    init_tracing();
    let counters = Counters::default();
    let server = TcpServer::bind(server_options(), counters.factory())
        .await
        .unwrap();
    server.start();

    let config = server_options().validate().unwrap();
    let codec = config.codec();
    let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

    // an empty frame must come back as an empty frame
    let empty = codec.encode(&[]).unwrap();
    socket.write_all(&empty).await.unwrap();
    let payload = timeout(Duration::from_secs(5), codec.decode(&mut socket))
        .await
        .unwrap()
        .unwrap();
    assert!(payload.is_empty());

    // and the connection must still be alive afterwards
    let frame = codec.encode(&[b"still here"]).unwrap();
    socket.write_all(&frame).await.unwrap();
    let payload = timeout(Duration::from_secs(5), codec.decode(&mut socket))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&payload[..], b"still here");

    server.close().await;
}

#[tokio::test]
async fn admission_control_rejects_past_cap() {
    init_tracing();
    let counters = Counters::default();
    let options = NetOptions {
        max_connections: 1,
        ..server_options()
    };
    let server = TcpServer::bind(options, counters.factory()).await.unwrap();
    server.start();

    let first = TcpStream::connect(server.local_addr()).await.unwrap();
    // let the accept loop admit the first connection
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 1);

    let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
    // the second socket is closed without ever reaching a handler
    let mut buf = [0u8; 1];
    let rejected = timeout(Duration::from_secs(5), second.read(&mut buf)).await;
    match rejected.expect("rejection should be prompt") {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes from rejected socket"),
        Err(_) => {} // reset is also acceptable
    }
    assert_eq!(counters.runs.load(Ordering::SeqCst), 1);

    drop(first);
    server.close().await;
    assert_eq!(counters.runs.load(Ordering::SeqCst), 1);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_close_is_complete_and_idempotent() {
    init_tracing();
    let counters = Counters::default();
    let server = Arc::new(
        TcpServer::bind(server_options(), counters.factory())
            .await
            .unwrap(),
    );
    server.start();

    // two idle connections blocked in read_frame
    let c1 = TcpStream::connect(server.local_addr()).await.unwrap();
    let c2 = TcpStream::connect(server.local_addr()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 2);

    // concurrent close calls behave like a single close
    tokio::join!(server.close(), server.close());

    assert_eq!(server.connection_count(), 0);
    assert_eq!(counters.runs.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 2);

    // a third close after teardown is still fine
    timeout(Duration::from_secs(5), server.close()).await.unwrap();
    drop((c1, c2));
}

#[tokio::test]
async fn close_before_start_is_harmless() {
    init_tracing();
    let counters = Counters::default();
    let server = TcpServer::bind(server_options(), counters.factory())
        .await
        .unwrap();
    timeout(Duration::from_secs(5), server.close()).await.unwrap();
}

#[tokio::test]
async fn backpressure_destroys_connection_instead_of_blocking() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (socket, peer) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let socket = socket.unwrap();
    let (_peer, _) = peer.unwrap(); // held open, never read from

    let config = NetOptions {
        length_field_width: 4,
        max_frame_len: u32::MAX,
        pending_write_capacity: 2,
        ..Default::default()
    }
    .validate()
    .unwrap();
    let conn = Connection::new(socket, &config);

    let big = vec![0u8; 1024 * 1024];
    for _ in 0..64 {
        // never blocks: either enqueued or the connection is destroyed
        conn.write_frame(&[&big]).unwrap();
        if conn.is_closed() {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert!(conn.is_closed());
    timeout(Duration::from_secs(5), conn.closed()).await.unwrap();

    // writes after destruction are silently dropped
    conn.write_frame(&[b"late"]).unwrap();
}

#[tokio::test]
async fn forced_destroy_stops_transmission_to_the_peer() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (socket, peer) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let socket = socket.unwrap();
    let (mut peer, _) = peer.unwrap();

    let config = NetOptions {
        length_field_width: 4,
        max_frame_len: u32::MAX,
        pending_write_capacity: 2,
        ..Default::default()
    }
    .validate()
    .unwrap();
    let conn = Connection::new(socket, &config);

    // a stalled peer: keep writing until the queue overflows and the
    // connection destroys itself
    let big = vec![0u8; 1024 * 1024];
    let mut attempted = 0usize;
    for _ in 0..64 {
        conn.write_frame(&[&big]).unwrap();
        attempted += big.len() + 4;
        if conn.is_closed() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(conn.is_closed());
    timeout(Duration::from_secs(5), conn.closed()).await.unwrap();

    // teardown is abrupt: the socket is reset, so the peer stops receiving
    // instead of draining the queued frames at its leisure
    let drained = timeout(Duration::from_secs(5), async {
        let mut total = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match peer.read(&mut buf).await {
                Ok(0) | Err(_) => break total,
                Ok(n) => total += n,
            }
        }
    })
    .await
    .expect("peer read must terminate once the connection is destroyed");
    assert!(
        drained < 16 * 1024 * 1024,
        "peer drained {drained} of {attempted} attempted bytes after forced destroy"
    );
}

#[tokio::test]
async fn raw_read_bypasses_the_codec() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (socket, peer) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let socket = socket.unwrap();
    let (mut peer, _) = peer.unwrap();

    let config = NetOptions::default().validate().unwrap();
    let conn = Connection::new(socket, &config);

    peer.write_all(b"no length prefix here").await.unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 8];
    while collected.len() < 21 {
        let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&collected[..], b"no length prefix here");

    // peer hangup surfaces as a zero-length read
    drop(peer);
    let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // and after close the read path reports the connection gone
    conn.close();
    timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert!(conn.read(&mut buf).await.is_err());
}

#[tokio::test]
async fn connection_close_is_idempotent_and_concurrent() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (socket, peer) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let socket = socket.unwrap();
    let _peer = peer.unwrap();

    let config = NetOptions::default().validate().unwrap();
    let conn = Arc::new(Connection::new(socket, &config));

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close() })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert!(conn.is_closed());
    conn.close(); // still a no-op
}

#[tokio::test]
async fn oversized_write_frame_leaves_connection_usable() {
    init_tracing();
    let counters = Counters::default();
    let server = TcpServer::bind(server_options(), counters.factory())
        .await
        .unwrap();
    server.start();

    let config = server_options().validate().unwrap();
    let codec = config.codec();
    let socket = TcpStream::connect(server.local_addr()).await.unwrap();
    let conn = Connection::new(socket, &config);

    // max_frame_len is 1000; this must fail on encode without side effects
    let oversized = vec![0u8; 1001];
    assert!(conn.write_frame(&[&oversized]).is_err());
    assert!(!conn.is_closed());

    conn.write_frame(&[b"fits"]).unwrap();
    let payload = timeout(Duration::from_secs(5), conn.read_frame())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&payload[..], b"fits");

    conn.close();
    server.close().await;
}

/// Client handler that reports each delivered frame on a channel.
struct ReportingHandler {
    runs: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    frames: mpsc::UnboundedSender<Bytes>,
}

impl Handler for ReportingHandler {
    async fn run(&mut self, conn: Arc<Connection>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        conn.write_frame(&[b"ping"]).unwrap();
        while let Ok(payload) = conn.read_frame().await {
            let _ = self.frames.send(payload);
        }
    }

    async fn on_close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn client_talks_to_server_and_closes_cleanly() {
    init_tracing();
    let server_counters = Counters::default();
    let server = TcpServer::bind(server_options(), server_counters.factory())
        .await
        .unwrap();
    server.start();

    let client_counters = Counters::default();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let runs = client_counters.runs.clone();
    let closes = client_counters.closes.clone();
    let factory = move || ReportingHandler {
        runs: runs.clone(),
        closes: closes.clone(),
        frames: frames_tx.clone(),
    };

    let options = NetOptions {
        remote_addr: server.local_addr().to_string(),
        auto_reconnect: false,
        ..server_options()
    };
    let client = TcpClient::new(options, factory).unwrap();
    client.start();

    // server echoes the handler's "ping" back
    let echoed = timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], b"ping");

    client.close().await;
    assert_eq!(client_counters.runs.load(Ordering::SeqCst), 1);
    assert_eq!(client_counters.closes.load(Ordering::SeqCst), 1);

    // idempotent
    timeout(Duration::from_secs(5), client.close()).await.unwrap();

    server.close().await;
}

#[tokio::test]
async fn client_retries_until_listener_appears() {
    init_tracing();
    // reserve an address, then free it so the first dials fail
    let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let counters = Counters::default();
    let options = NetOptions {
        remote_addr: addr.to_string(),
        reconnect_interval: Duration::from_millis(10),
        auto_reconnect: true,
        ..server_options()
    };
    let client = TcpClient::new(options, counters.factory()).unwrap();
    client.start();

    // let a few dial attempts fail first
    sleep(Duration::from_millis(100)).await;
    assert_eq!(counters.runs.load(Ordering::SeqCst), 0);

    let listener = TcpListener::bind(addr).await.unwrap();
    let (_socket, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .unwrap()
        .unwrap();

    // the handler is constructed exactly once, on the first successful retry
    sleep(Duration::from_millis(200)).await;
    assert_eq!(counters.runs.load(Ordering::SeqCst), 1);

    client.close().await;
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn client_close_races_with_connection_establishment() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // accept and hold sockets open so any handler that does start blocks
    // in read_frame until its connection is closed
    let acceptor = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    for round in 0..20u32 {
        let counters = Counters::default();
        let options = NetOptions {
            remote_addr: addr.to_string(),
            auto_reconnect: false,
            ..server_options()
        };
        let client = TcpClient::new(options, counters.factory()).unwrap();
        client.start();

        // land close() at different points of the dial: sometimes before the
        // connection exists, sometimes while it is being set up, sometimes
        // with the handler already running
        if round % 2 == 0 {
            tokio::task::yield_now().await;
        } else {
            sleep(Duration::from_millis(1)).await;
        }
        timeout(Duration::from_secs(5), client.close())
            .await
            .expect("close must finish no matter where the dial got to");

        // a handler that ran has been fully torn down by the time close returns
        assert_eq!(
            counters.runs.load(Ordering::SeqCst),
            counters.closes.load(Ordering::SeqCst)
        );
    }
    acceptor.abort();
}
