//! Responder side of the bandwidth test.
//!
//! `Responder` owns the control-channel socket and answers each datagram in
//! turn.  Accepted tests run their data-plane tasks in the background; the
//! client->server measurement is kept in a [`ResultStore`] keyed by the
//! initiator's authentication key until the retention window passes.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine;
use crate::params::{AuthKey, TestParameters, TestResult};
use crate::sync::{ResultSlot, GRACE_PERIOD, GRACE_PERIOD_SEND, MAX_RTT};
use crate::transport::{DatagramConn, UdpConn};
use crate::wire::{ControlMessage, ReplyStatus, Role};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long a finished result stays available to `'R'` queries.
pub const RESULT_RETENTION: Duration = Duration::from_secs(60);

/// Interval between result store sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Control datagrams are tiny; anything longer is truncated and ignored.
const CONTROL_BUFFER_LEN: usize = 2500;

// ---------------------------------------------------------------------------
// ResultStore
// ---------------------------------------------------------------------------

/// One accepted test.
struct TestRecord {
    test_id: String,
    peer: SocketAddr,
    /// Client->server measurement.
    slot: Arc<ResultSlot>,
    /// When the server->client stream is expected to be sent.
    send_done: Instant,
}

impl TestRecord {
    /// Time until both directions are expected to be over.
    fn busy_for(&self, now: Instant) -> Duration {
        let mut until = self.send_done;
        if !self.slot.is_final() {
            until = until.max(self.slot.expected_finish());
        }
        until.saturating_duration_since(now)
    }
}

/// Outcome of looking up a key in the [`ResultStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLookup {
    Unknown,
    /// Still receiving; expected to finish after this long.
    Pending(Duration),
    Ready(TestResult),
}

/// Tests known to the responder, keyed by the client->server key.
pub struct ResultStore {
    records: RwLock<HashMap<AuthKey, TestRecord>>,
    retention: Duration,
}

impl ResultStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn contains(&self, key: &AuthKey) -> bool {
        self.records.read().await.contains_key(key)
    }

    /// Longest time any known test still needs, or `None` when idle.
    pub async fn busy_for(&self) -> Option<Duration> {
        let now = Instant::now();
        self.records
            .read()
            .await
            .values()
            .map(|record| record.busy_for(now))
            .filter(|left| !left.is_zero())
            .max()
    }

    async fn insert(&self, key: AuthKey, record: TestRecord) {
        self.records.write().await.insert(key, record);
    }

    pub async fn lookup(&self, key: &AuthKey) -> ResultLookup {
        let records = self.records.read().await;
        let Some(record) = records.get(key) else {
            return ResultLookup::Unknown;
        };

        let result = record.slot.snapshot();
        if result.is_final() {
            ResultLookup::Ready(result)
        } else {
            let left = record
                .slot
                .expected_finish()
                .saturating_duration_since(Instant::now());
            ResultLookup::Pending(left)
        }
    }

    /// Drop finished results older than the retention window.
    ///
    /// Returns the number of records removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(RESULT_RETENTION.as_secs() as i64));
        let mut records = self.records.write().await;
        let before = records.len();

        records.retain(|_, record| {
            let result = record.slot.snapshot();
            let keep = !result.is_final() || result.expected_finish_time + retention > now;
            if !keep {
                info!(
                    test_id = record.test_id.as_str(),
                    peer = %record.peer,
                    "evicted expired result"
                );
            }
            keep
        });

        before - records.len()
    }
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Settings for [`Responder`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Control-channel address.
    pub listen: SocketAddr,
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl ServerOptions {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            retention: RESULT_RETENTION,
            cleanup_interval: CLEANUP_INTERVAL,
        }
    }
}

/// Bandwidth test responder.
pub struct Responder {
    socket: UdpSocket,
    store: Arc<ResultStore>,
    options: ServerOptions,
}

impl Responder {
    /// Bind the control-channel socket.
    pub async fn bind(options: ServerOptions) -> Result<Self> {
        let socket = UdpSocket::bind(options.listen)
            .await
            .with_context(|| format!("failed to bind control socket on {}", options.listen))?;
        Ok(Self {
            socket,
            store: Arc::new(ResultStore::new(options.retention)),
            options,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn store(&self) -> Arc<ResultStore> {
        Arc::clone(&self.store)
    }

    /// Answer control datagrams until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listen = self.local_addr().context("control socket has no local address")?;
        info!(addr = %listen, "bwtester server listening");

        // Periodic result store cleanup.
        let store = Arc::clone(&self.store);
        let sweep_cancel = cancel.clone();
        let every = self.options.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = store.cleanup_expired().await;
                        if removed > 0 {
                            debug!(removed, "result store sweep");
                        }
                    }
                }
            }
        });

        let mut buf = vec![0u8; CONTROL_BUFFER_LEN];
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(error = %e, "control receive failed");
                        continue;
                    }
                },
            };

            let Some(reply) = self.handle_datagram(peer, &buf[..len]).await else {
                continue;
            };
            if let Err(e) = self.socket.send_to(&reply.encode(), peer).await {
                warn!(peer = %peer, error = %e, "failed to send control reply");
            }
        }

        info!("bwtester server stopped");
        Ok(())
    }

    /// Process one control datagram from `peer`, returning the reply if any.
    ///
    /// Datagrams that do not decode as a request are dropped without reply.
    pub async fn handle_datagram(&self, peer: SocketAddr, datagram: &[u8]) -> Option<ControlMessage> {
        let message = match ControlMessage::decode(Role::Request, datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer, error = %e, "ignoring malformed control datagram");
                return None;
            }
        };

        match message {
            ControlMessage::NewTest {
                client_to_server,
                server_to_client,
            } => self.handle_new_test(peer, client_to_server, server_to_client).await,
            ControlMessage::ResultRequest(key) => Some(self.handle_result_request(peer, &key).await),
            other => {
                debug!(peer = %peer, message = ?other, "ignoring reply-only message");
                None
            }
        }
    }

    async fn handle_new_test(
        &self,
        peer: SocketAddr,
        client_to_server: TestParameters,
        server_to_client: TestParameters,
    ) -> Option<ControlMessage> {
        let (Some(cs), Some(sc)) = (client_to_server.sanitized(), server_to_client.sanitized()) else {
            debug!(peer = %peer, "ignoring new test with empty direction");
            return None;
        };

        // The first acknowledgement may have been lost.
        if self.store.contains(&cs.auth_key).await {
            debug!(peer = %peer, key = %cs.auth_key.fingerprint(), "re-acknowledging known test");
            return Some(ControlMessage::NewTestReply(ReplyStatus::Ok));
        }

        if let Some(left) = self.store.busy_for().await {
            info!(peer = %peer, wait_secs = left.as_secs_f64(), "busy, asking client to retry");
            return Some(ControlMessage::NewTestReply(ReplyStatus::retry_after(left)));
        }

        match self.start_test(peer, cs, sc).await {
            Ok(()) => Some(ControlMessage::NewTestReply(ReplyStatus::Ok)),
            Err(e) => {
                error!(peer = %peer, error = %e, "failed to start test");
                Some(ControlMessage::NewTestReply(ReplyStatus::retry_after(MAX_RTT)))
            }
        }
    }

    /// Open the data channel and spawn both data-plane tasks.
    async fn start_test(&self, peer: SocketAddr, cs: TestParameters, sc: TestParameters) -> Result<()> {
        let listen = self.local_addr().context("control socket has no local address")?;
        let local = SocketAddr::new(listen.ip(), cs.port);
        let remote = SocketAddr::new(peer.ip(), sc.port);
        let conn = UdpConn::open(local, remote)
            .await
            .with_context(|| format!("failed to open data channel {} -> {}", local, remote))?;
        let conn: Arc<dyn DatagramConn> = Arc::new(conn);

        let test_id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let slot = Arc::new(ResultSlot::new(
            cs.auth_key.clone(),
            now + cs.duration + GRACE_PERIOD,
        ));

        info!(
            test_id = test_id.as_str(),
            peer = %peer,
            data_local = %local,
            data_remote = %remote,
            cs_packets = cs.num_packets,
            cs_size = cs.packet_size,
            sc_packets = sc.num_packets,
            sc_size = sc.packet_size,
            "starting test"
        );

        engine::spawn_receiver(&test_id, cs.clone(), Arc::clone(&conn), Arc::clone(&slot));
        engine::spawn_sender(&test_id, sc.clone(), conn);

        self.store
            .insert(
                cs.auth_key.clone(),
                TestRecord {
                    test_id,
                    peer,
                    slot,
                    send_done: now + sc.duration + GRACE_PERIOD_SEND,
                },
            )
            .await;
        Ok(())
    }

    async fn handle_result_request(&self, peer: SocketAddr, key: &AuthKey) -> ControlMessage {
        match self.store.lookup(key).await {
            ResultLookup::Ready(result) => {
                debug!(peer = %peer, received = ?result.packets_received, "returning result");
                ControlMessage::ResultReply {
                    status: ReplyStatus::Ok,
                    result: Some(result),
                }
            }
            ResultLookup::Pending(left) => ControlMessage::ResultReply {
                status: ReplyStatus::retry_after(left),
                result: None,
            },
            ResultLookup::Unknown => {
                debug!(peer = %peer, "result request for unknown key");
                ControlMessage::ResultReply {
                    status: ReplyStatus::NotFound,
                    result: None,
                }
            }
        }
    }
}

/// Bind and serve until `cancel` fires.
pub async fn run(options: ServerOptions, cancel: CancellationToken) -> Result<()> {
    Responder::bind(options).await?.run(cancel).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::AUTH_KEY_LEN;

    fn params(seed: u8, port: u16) -> TestParameters {
        TestParameters {
            duration: Duration::from_secs(2),
            packet_size: 100,
            num_packets: 4,
            auth_key: AuthKey::from_bytes([seed; AUTH_KEY_LEN]),
            port,
        }
    }

    async fn responder() -> Responder {
        Responder::bind(ServerOptions::new("127.0.0.1:0".parse().unwrap()))
            .await
            .expect("bind responder")
    }

    /// A peer address with a bound socket behind it so sends do not fail.
    async fn sink() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn new_test(seed: u8, sink_port: u16) -> Vec<u8> {
        ControlMessage::NewTest {
            client_to_server: params(seed, 0),
            server_to_client: params(seed + 1, sink_port),
        }
        .encode()
        .to_vec()
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_ignored() {
        let server = responder().await;
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        assert!(server.handle_datagram(peer, b"").await.is_none());
        assert!(server.handle_datagram(peer, b"N123").await.is_none());
        assert!(server.handle_datagram(peer, b"Zgarbage").await.is_none());
        assert!(server.handle_datagram(peer, &[b'R', 1, 2]).await.is_none());
        assert_eq!(server.store.len().await, 0);
    }

    #[tokio::test]
    async fn test_empty_direction_is_ignored() {
        let server = responder().await;
        let (_sink, peer) = sink().await;
        let mut cs = params(1, 0);
        cs.num_packets = 0;
        let request = ControlMessage::NewTest {
            client_to_server: cs,
            server_to_client: params(2, peer.port()),
        }
        .encode();

        assert!(server.handle_datagram(peer, &request).await.is_none());
    }

    #[tokio::test]
    async fn test_accepts_then_reports_busy() {
        let server = responder().await;
        let (_sink, peer) = sink().await;

        let reply = server.handle_datagram(peer, &new_test(10, peer.port())).await;
        assert_eq!(reply, Some(ControlMessage::NewTestReply(ReplyStatus::Ok)));

        let reply = server.handle_datagram(peer, &new_test(20, peer.port())).await;
        match reply {
            Some(ControlMessage::NewTestReply(ReplyStatus::RetryAfter(secs))) => {
                assert!((1..=126).contains(&secs));
            }
            other => panic!("expected busy reply, got {:?}", other),
        }
        assert_eq!(server.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_retransmitted_new_test_is_reacknowledged() {
        let server = responder().await;
        let (_sink, peer) = sink().await;
        let request = new_test(30, peer.port());

        for _ in 0..2 {
            let reply = server.handle_datagram(peer, &request).await;
            assert_eq!(reply, Some(ControlMessage::NewTestReply(ReplyStatus::Ok)));
        }
        assert_eq!(server.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_result_request_states() {
        let server = responder().await;
        let (_sink, peer) = sink().await;
        let key = AuthKey::from_bytes([40; AUTH_KEY_LEN]);
        let request = ControlMessage::ResultRequest(key.clone()).encode();

        let reply = server.handle_datagram(peer, &request).await;
        assert_eq!(
            reply,
            Some(ControlMessage::ResultReply {
                status: ReplyStatus::NotFound,
                result: None
            })
        );

        server.handle_datagram(peer, &new_test(40, peer.port())).await;
        match server.handle_datagram(peer, &request).await {
            Some(ControlMessage::ResultReply {
                status: ReplyStatus::RetryAfter(secs),
                result: None,
            }) => assert!(secs >= 1),
            other => panic!("expected pending reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_ready_and_cleanup() {
        let store = ResultStore::new(Duration::ZERO);
        let key = AuthKey::from_bytes([50; AUTH_KEY_LEN]);
        let slot = Arc::new(ResultSlot::new(key.clone(), Instant::now() + Duration::from_secs(5)));
        store
            .insert(
                key.clone(),
                TestRecord {
                    test_id: "t".into(),
                    peer: "127.0.0.1:1".parse().unwrap(),
                    slot: Arc::clone(&slot),
                    send_done: Instant::now(),
                },
            )
            .await;

        assert!(matches!(store.lookup(&key).await, ResultLookup::Pending(_)));
        assert!(store.busy_for().await.is_some());
        assert_eq!(store.cleanup_expired().await, 0);

        slot.complete(4, 3);
        match store.lookup(&key).await {
            ResultLookup::Ready(result) => {
                assert_eq!(result.packets_received, Some(4));
                assert_eq!(result.packets_correct, Some(3));
            }
            other => panic!("expected ready result, got {:?}", other),
        }
        assert!(store.busy_for().await.is_none());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.lookup(&key).await, ResultLookup::Unknown);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let server = responder().await;
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), server.run(cancel))
            .await
            .expect("server did not stop")
            .expect("server failed");
    }
}
