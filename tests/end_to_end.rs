//! Loopback tests exercising a real responder and initiator over UDP.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bwtester::client::{self, negotiate_start, fetch_result, ClientError, ClientOptions, RetryPolicy};
use bwtester::engine;
use bwtester::params::{AuthKey, DirectionSpec, TestParameters};
use bwtester::server::{Responder, ServerOptions};
use bwtester::sync::ResultSlot;
use bwtester::transport::{DatagramConn, UdpConn};
use bwtester::wire::ControlMessage;

async fn start_responder(addr: &str) -> (SocketAddr, CancellationToken) {
    let responder = Responder::bind(ServerOptions::new(addr.parse().unwrap()))
        .await
        .expect("bind responder");
    let local = responder.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move { responder.run(token).await });
    (local, cancel)
}

fn params(secs: u64, size: usize, num: usize, port: u16) -> TestParameters {
    TestParameters {
        duration: Duration::from_secs(secs),
        packet_size: size,
        num_packets: num,
        auth_key: AuthKey::generate().unwrap(),
        port,
    }
}

#[tokio::test]
async fn test_loopback_full_run() {
    let (server, cancel) = start_responder("127.0.0.1:42002").await;

    let spec: DirectionSpec = "1,100,10".parse().unwrap();
    let report = client::run(ClientOptions {
        local: "127.0.0.1:42010".parse().unwrap(),
        server,
        client_to_server: spec,
        server_to_client: spec,
        retry: RetryPolicy::default(),
    })
    .await
    .expect("test run");

    assert!(report.is_success(), "failure: {:?}", report.failure);
    assert_eq!(report.server_to_client.packets_received, Some(10));
    assert_eq!(report.server_to_client.packets_correct, Some(10));
    assert_eq!(report.server_to_client.loss_percent, 0.0);

    let cs = report.client_to_server.expect("client->server report");
    assert_eq!(cs.packets_received, Some(10));
    assert_eq!(cs.packets_correct, Some(10));
    assert_eq!(cs.attempted_bps, 8000.0);

    cancel.cancel();
}

#[tokio::test]
async fn test_asymmetric_durations_wait_for_the_longer_direction() {
    let (server, cancel) = start_responder("127.0.0.1:42102").await;

    let started = Instant::now();
    let report = client::run(ClientOptions {
        local: "127.0.0.1:42110".parse().unwrap(),
        server,
        client_to_server: "1,64,4".parse().unwrap(),
        server_to_client: "2,64,4".parse().unwrap(),
        retry: RetryPolicy::default(),
    })
    .await
    .expect("test run");
    let elapsed = started.elapsed();

    assert!(report.is_success(), "failure: {:?}", report.failure);
    // max(1, 2) plus margins, never the sum of both plus margins.
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(7));

    cancel.cancel();
}

/// Flips a byte in every third outgoing packet, starting with the first.
struct CorruptEveryThird<C> {
    inner: C,
    sent: AtomicUsize,
}

#[async_trait]
impl<C: DatagramConn> DatagramConn for CorruptEveryThird<C> {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let index = self.sent.fetch_add(1, Ordering::SeqCst);
        if index % 3 == 0 {
            let mut corrupted = buf.to_vec();
            let last = corrupted.len() - 1;
            corrupted[last] ^= 0xff;
            self.inner.send(&corrupted).await
        } else {
            self.inner.send(buf).await
        }
    }

    async fn recv_until(&self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        self.inner.recv_until(buf, deadline).await
    }
}

/// Stream `params` across a loopback pair and return the receiver's counts.
async fn stream_over_loopback(params: TestParameters, corrupt: bool) -> (u64, u64) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.connect(b.local_addr().unwrap()).await.unwrap();
    b.connect(a.local_addr().unwrap()).await.unwrap();

    let sender: Arc<dyn DatagramConn> = if corrupt {
        Arc::new(CorruptEveryThird {
            inner: UdpConn::from_socket(a),
            sent: AtomicUsize::new(0),
        })
    } else {
        Arc::new(UdpConn::from_socket(a))
    };
    let receiver: Arc<dyn DatagramConn> = Arc::new(UdpConn::from_socket(b));

    let slot = Arc::new(ResultSlot::new(
        params.auth_key.clone(),
        Instant::now() + params.duration + Duration::from_secs(3),
    ));
    let rx = engine::spawn_receiver("loopback", params.clone(), receiver, Arc::clone(&slot));
    let tx = engine::spawn_sender("loopback", params.clone(), sender);

    let sent = tx.await.unwrap().expect("send stream");
    assert_eq!(sent.packets_sent, params.num_packets);

    let summary = rx.await.unwrap();
    let result = slot.snapshot();
    assert_eq!(result.packets_received, Some(summary.packets_received));
    assert_eq!(result.packets_correct, Some(summary.packets_correct));
    (summary.packets_received, summary.packets_correct)
}

#[tokio::test]
async fn test_clean_stream_of_five_packets() {
    let (received, correct) = stream_over_loopback(params(5, 1000, 5, 0), false).await;
    assert_eq!(received, 5);
    assert_eq!(correct, 5);
}

#[tokio::test]
async fn test_every_third_of_five_packets_corrupted() {
    let (received, correct) = stream_over_loopback(params(5, 1000, 5, 0), true).await;
    assert_eq!(received, 5);
    // ceil(5 / 3) packets damaged.
    assert_eq!(correct, 5 - 2);
}

#[tokio::test]
async fn test_corrupted_packets_are_received_but_not_correct() {
    let (received, correct) = stream_over_loopback(params(1, 1000, 30, 0), true).await;
    assert_eq!(received, 30);
    assert_eq!(correct, 20);
}

#[tokio::test]
async fn test_unknown_key_is_not_found_without_retries() {
    let (server, cancel) = start_responder("127.0.0.1:0").await;
    let control = UdpConn::open("127.0.0.1:0".parse().unwrap(), server)
        .await
        .unwrap();

    let started = Instant::now();
    let err = fetch_result(&control, &AuthKey::generate().unwrap(), &RetryPolicy::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::ResultNotFound));
    assert!(started.elapsed() < Duration::from_secs(1));
    cancel.cancel();
}

#[tokio::test]
async fn test_busy_responder_asks_second_initiator_to_wait() {
    let (server, cancel) = start_responder("127.0.0.1:0").await;
    // Absorbs the responder's server->client streams.
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_port = sink.local_addr().unwrap().port();

    let first = UdpConn::open("127.0.0.1:0".parse().unwrap(), server)
        .await
        .unwrap();
    let request = ControlMessage::NewTest {
        client_to_server: params(1, 64, 2, 0),
        server_to_client: params(1, 64, 2, sink_port),
    }
    .encode();
    let stats = negotiate_start(&first, request, &RetryPolicy::default(), |_| {})
        .await
        .expect("first test accepted");
    assert_eq!(stats.backoffs, 0);

    let second = UdpConn::open("127.0.0.1:0".parse().unwrap(), server)
        .await
        .unwrap();
    let request = ControlMessage::NewTest {
        client_to_server: params(1, 64, 2, 0),
        server_to_client: params(1, 64, 2, sink_port),
    }
    .encode();
    let stats = negotiate_start(&second, request, &RetryPolicy::default(), |_| {})
        .await
        .expect("second test accepted after waiting");

    assert!(stats.backoffs >= 1);
    assert_eq!(stats.failed_attempts, 0);
    cancel.cancel();
}
