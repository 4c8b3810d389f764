//! Initiator side of the bandwidth test.
//!
//! ```text
//! Idle -> AwaitingStart -> Running -> AwaitingResult -> Done
//!              |                            |
//!              +---------> Failed <---------+
//! ```
//!
//! Both control-plane phases run a bounded retry loop.  Transport and
//! protocol errors consume the attempt budget; a responder asking us to back
//! off never does.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine;
use crate::params::{AuthKey, DirectionSpec, ParamError, TestResult};
use crate::report::{Direction, DirectionReport, TestReport};
use crate::sync::{self, ResultSlot, MAX_RTT, STRAGGLER_WAIT_PERIOD};
use crate::transport::{DatagramConn, UdpConn};
use crate::wire::{ControlMessage, ReplyStatus, Role, MAX_CONTROL_MESSAGE_LEN, RESULT_LEN};

/// Attempts per control-plane phase.
pub const MAX_TRIES: u32 = 5;

/// Pause before resending after a malformed reply.
pub const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// How long to wait for the local receive task after the test settled.
const FINAL_RESULT_WAIT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid test parameters: {0}")]
    Params(#[from] ParamError),

    #[error("{0} port has no successor for the data channel")]
    NoDataPort(SocketAddr),

    #[error("failed to set up {what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("server did not accept the test after {0} attempts")]
    StartExhausted(u32),

    #[error("could not fetch server results after {0} attempts")]
    ResultExhausted(u32),

    #[error("results could not be found on the server or the key was rejected")]
    ResultNotFound,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Knobs of the control-plane retry loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_tries: u32,
    /// Read deadline for each reply.
    pub reply_timeout: Duration,
    /// Pause after a malformed reply.
    pub retry_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: MAX_TRIES,
            reply_timeout: MAX_RTT,
            retry_pause: RETRY_PAUSE,
        }
    }
}

/// Outcome of one request/reply exchange.
#[derive(Debug)]
enum Attempt<T> {
    /// Finished successfully.
    Done(T),
    /// Failed in a way that consumes budget, optionally pausing first.
    Failed { reason: &'static str, pause: Duration },
    /// The responder asked us to wait; consumes no budget.
    Backoff(Duration),
    /// Unrecoverable; stop retrying.
    Abort(ClientError),
}

/// Counts budget-consuming attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Charge one failed attempt.  Returns whether any attempts remain.
    pub fn charge(&mut self) -> bool {
        self.used = self.used.saturating_add(1);
        self.used < self.max
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.max
    }
}

/// Counters describing how a control-plane phase went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Attempts that consumed budget.
    pub failed_attempts: u32,
    /// Server-requested waits.
    pub backoffs: u32,
}

/// Budget and counters of one retry loop.
struct Retrier {
    budget: RetryBudget,
    stats: ExchangeStats,
}

impl Retrier {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            budget: RetryBudget::new(policy.max_tries),
            stats: ExchangeStats::default(),
        }
    }

    fn has_budget(&self) -> bool {
        !self.budget.exhausted()
    }

    /// Account for one attempt.  `Some` ends the loop.
    async fn absorb<T>(&mut self, attempt: Attempt<T>) -> Option<Result<T, ClientError>> {
        match attempt {
            Attempt::Done(value) => Some(Ok(value)),
            Attempt::Abort(e) => Some(Err(e)),
            Attempt::Backoff(wait) => {
                self.stats.backoffs += 1;
                info!(wait_secs = wait.as_secs(), "server asked us to wait");
                tokio::time::sleep(wait).await;
                None
            }
            Attempt::Failed { reason, pause } => {
                let remaining = self.budget.charge();
                self.stats.failed_attempts = self.budget.used();
                debug!(reason, attempt = self.budget.used(), "attempt failed");
                if remaining && !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control-plane exchanges
// ---------------------------------------------------------------------------

async fn request_reply<C>(
    conn: &C,
    request: &[u8],
    timeout: Duration,
    buf: &mut [u8],
) -> Result<usize, &'static str>
where
    C: DatagramConn + ?Sized,
{
    conn.send(request).await.map_err(|e| {
        debug!(error = %e, "control send failed");
        "send failed"
    })?;
    conn.recv_until(buf, Instant::now() + timeout)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut => "reply timed out",
            _ => "receive failed",
        })
}

/// Send the new-test request until the responder accepts it.
///
/// `on_retry` runs before every resend with the time we are about to wait:
/// zero after a lost or failed reply, the requested delay when the responder
/// is busy.
pub async fn negotiate_start<C>(
    conn: &C,
    request: Bytes,
    policy: &RetryPolicy,
    mut on_retry: impl FnMut(Duration),
) -> Result<ExchangeStats, ClientError>
where
    C: DatagramConn + ?Sized,
{
    let mut buf = vec![0u8; MAX_CONTROL_MESSAGE_LEN];
    let mut retry = Retrier::new(policy);
    while retry.has_budget() {
        let attempt = match_start_reply(conn, &request, policy, &mut buf, &mut on_retry).await;
        if let Some(done) = retry.absorb(attempt).await {
            return done.map(|()| retry.stats);
        }
    }
    Err(ClientError::StartExhausted(retry.stats.failed_attempts))
}

async fn match_start_reply<C>(
    conn: &C,
    request: &[u8],
    policy: &RetryPolicy,
    buf: &mut [u8],
    on_retry: &mut impl FnMut(Duration),
) -> Attempt<()>
where
    C: DatagramConn + ?Sized,
{
    let len = match request_reply(conn, request, policy.reply_timeout, buf).await {
        Ok(len) => len,
        Err(reason) => {
            on_retry(Duration::ZERO);
            return Attempt::Failed {
                reason,
                pause: Duration::ZERO,
            };
        }
    };

    match ControlMessage::decode(Role::Reply, &buf[..len]) {
        Ok(ControlMessage::NewTestReply(ReplyStatus::Ok)) => Attempt::Done(()),
        Ok(ControlMessage::NewTestReply(ReplyStatus::RetryAfter(secs))) => {
            let wait = Duration::from_secs(u64::from(secs));
            on_retry(wait);
            Attempt::Backoff(wait)
        }
        other => {
            warn!(reply = ?other, "incorrect server response, trying again");
            Attempt::Failed {
                reason: "incorrect response",
                pause: policy.retry_pause,
            }
        }
    }
}

/// Fetch the responder's measurement for the test keyed by `key`.
pub async fn fetch_result<C>(
    conn: &C,
    key: &AuthKey,
    policy: &RetryPolicy,
) -> Result<(TestResult, ExchangeStats), ClientError>
where
    C: DatagramConn + ?Sized,
{
    let request = ControlMessage::ResultRequest(key.clone()).encode();
    let mut buf = vec![0u8; 2 + RESULT_LEN];
    let mut retry = Retrier::new(policy);
    while retry.has_budget() {
        let attempt = match_result_reply(conn, &request, key, policy, &mut buf).await;
        if let Some(done) = retry.absorb(attempt).await {
            return done.map(|result| (result, retry.stats));
        }
    }
    Err(ClientError::ResultExhausted(retry.stats.failed_attempts))
}

async fn match_result_reply<C>(
    conn: &C,
    request: &[u8],
    key: &AuthKey,
    policy: &RetryPolicy,
    buf: &mut [u8],
) -> Attempt<TestResult>
where
    C: DatagramConn + ?Sized,
{
    let len = match request_reply(conn, request, policy.reply_timeout, buf).await {
        Ok(len) => len,
        Err(reason) => {
            return Attempt::Failed {
                reason,
                pause: Duration::ZERO,
            }
        }
    };

    match ControlMessage::decode(Role::Reply, &buf[..len]) {
        Ok(ControlMessage::ResultReply {
            status: ReplyStatus::Ok,
            result: Some(result),
        }) => {
            if &result.auth_key != key {
                warn!("server returned a result for a different key, this should never happen");
                return Attempt::Failed {
                    reason: "key mismatch",
                    pause: Duration::ZERO,
                };
            }
            Attempt::Done(result)
        }
        Ok(ControlMessage::ResultReply {
            status: ReplyStatus::NotFound,
            ..
        }) => Attempt::Abort(ClientError::ResultNotFound),
        Ok(ControlMessage::ResultReply {
            status: ReplyStatus::RetryAfter(secs),
            ..
        }) => {
            info!(secs, "results not ready yet");
            Attempt::Backoff(Duration::from_secs(u64::from(secs)))
        }
        other => {
            debug!(reply = ?other, "unusable result reply");
            Attempt::Failed {
                reason: "malformed result reply",
                pause: policy.retry_pause,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

/// Lifecycle of one test run on the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingStart,
    Running,
    AwaitingResult,
    Done,
    Failed,
}

/// Addresses and direction specs for one run.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Local control-channel address; the data channel uses the next port.
    pub local: SocketAddr,
    /// Responder control-channel address.
    pub server: SocketAddr,
    pub client_to_server: DirectionSpec,
    pub server_to_client: DirectionSpec,
    pub retry: RetryPolicy,
}

/// Address of the data channel paired with a control address.
///
/// Port 0 stays 0 so the operating system picks one.
pub fn data_channel_addr(control: SocketAddr) -> Result<SocketAddr, ClientError> {
    let port = match control.port() {
        0 => 0,
        p => p.checked_add(1).ok_or(ClientError::NoDataPort(control))?,
    };
    Ok(SocketAddr::new(control.ip(), port))
}

fn setup_error(what: &'static str) -> impl FnOnce(anyhow::Error) -> ClientError {
    move |source| ClientError::Setup { what, source }
}

/// Runs one bandwidth test against a responder.
pub struct Initiator {
    options: ClientOptions,
    phase: Phase,
}

impl Initiator {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            phase: Phase::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    /// Run the whole test and produce a report.
    ///
    /// Errors before the test starts are returned as `Err`; a failure to
    /// retrieve the responder's measurement still yields the locally
    /// measured direction, with the failure recorded in the report.
    pub async fn run(&mut self) -> Result<TestReport, ClientError> {
        let outcome = self.run_phases().await;
        if outcome.as_ref().map_or(true, |r| r.failure.is_some()) {
            self.enter(Phase::Failed);
        } else {
            self.enter(Phase::Done);
        }
        outcome
    }

    async fn run_phases(&mut self) -> Result<TestReport, ClientError> {
        let opts = self.options.clone();

        let control = UdpConn::open(opts.local, opts.server)
            .await
            .map_err(setup_error("control channel"))?;
        let local_control = control.local_addr().map_err(|e| ClientError::Setup {
            what: "control channel",
            source: e.into(),
        })?;

        let server_data = data_channel_addr(opts.server)?;
        let data = UdpConn::open(data_channel_addr(local_control)?, server_data)
            .await
            .map_err(setup_error("data channel"))?;
        let local_data = data.local_addr().map_err(|e| ClientError::Setup {
            what: "data channel",
            source: e.into(),
        })?;
        let data: Arc<dyn DatagramConn> = Arc::new(data);

        let cs = opts.client_to_server.into_parameters(server_data.port())?;
        let sc = opts.server_to_client.into_parameters(local_data.port())?;

        info!(
            control = %local_control,
            data = %local_data,
            server = %opts.server,
            client_to_server = %opts.client_to_server,
            server_to_client = %opts.server_to_client,
            "starting bandwidth test"
        );

        let test_id = format!("client-{}", cs.auth_key.fingerprint());
        let slot = Arc::new(ResultSlot::new(
            sc.auth_key.clone(),
            sync::completion_deadline(Instant::now(), &cs, &sc),
        ));
        let receiver = engine::spawn_receiver(&test_id, sc.clone(), Arc::clone(&data), Arc::clone(&slot));

        // AwaitingStart
        self.enter(Phase::AwaitingStart);
        let request = ControlMessage::NewTest {
            client_to_server: cs.clone(),
            server_to_client: sc.clone(),
        }
        .encode();
        let sc_duration = sc.duration;
        // Keep the local receiver listening while the handshake drags on.
        let start_stats = negotiate_start(&control, request, &opts.retry, |wait| {
            slot.extend_finish(Instant::now() + wait + sc_duration + MAX_RTT + STRAGGLER_WAIT_PERIOD);
        })
        .await?;
        debug!(?start_stats, "server accepted test");

        // Running
        self.enter(Phase::Running);
        let running_since = Instant::now();
        let settle_at = sync::completion_deadline(running_since, &cs, &sc);
        slot.extend_finish(settle_at);
        let sender = engine::spawn_sender(&test_id, cs.clone(), Arc::clone(&data));

        sync::wait_until_settled(&slot, settle_at).await;
        let local = slot.wait_final(Instant::now() + FINAL_RESULT_WAIT).await;
        if !receiver.is_finished() {
            debug!("receive task still running after settle time");
        }
        let send_failure = match sender.await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("send task failed: {}", e)),
        };

        let server_to_client = DirectionReport::new(Direction::ServerToClient, &sc, &local);

        // AwaitingResult
        self.enter(Phase::AwaitingResult);
        let fetched = fetch_result(&control, &cs.auth_key, &opts.retry).await;
        let (client_to_server, failure) = match fetched {
            Ok((remote, stats)) => {
                debug!(?stats, "fetched server result");
                (
                    Some(DirectionReport::new(Direction::ClientToServer, &cs, &remote)),
                    send_failure,
                )
            }
            Err(e) => {
                warn!(error = %e, "could not retrieve server result");
                (None, Some(e.to_string()))
            }
        };

        Ok(TestReport {
            server_to_client,
            client_to_server,
            failure,
        })
    }
}

/// Run one test with `options`.
pub async fn run(options: ClientOptions) -> Result<TestReport, ClientError> {
    Initiator::new(options).run().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
