//! Data-plane engines: one paced sender and one verifying receiver per
//! direction.
//!
//! Each engine runs as its own task and owns its packet buffer.  The only
//! state a receiver shares is its [`ResultSlot`](crate::sync::ResultSlot).
//! Neither engine is cancelled from outside: a sender stops after its last
//! packet, a receiver after its last packet or its deadline.

pub mod receiver;
pub mod sender;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use crate::params::TestParameters;
use crate::sync::ResultSlot;
use crate::transport::DatagramConn;

pub use receiver::receive_stream;
pub use sender::send_stream;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that abort a direction.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("short write on packet {index}: {written} of {expected} bytes")]
    ShortWrite {
        index: usize,
        written: usize,
        expected: usize,
    },

    #[error("send failed on packet {index}: {source}")]
    Send {
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// What a sender accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSummary {
    pub packets_sent: usize,
    /// Packets that went out after their ideal send time.
    pub late_packets: usize,
    pub elapsed: Duration,
}

/// What a receiver observed.  Also recorded in the direction's slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub packets_received: u64,
    pub packets_correct: u64,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// Task spawning
// ---------------------------------------------------------------------------

/// Run [`send_stream`] on its own task.
pub fn spawn_sender(
    test_id: &str,
    params: TestParameters,
    conn: Arc<dyn DatagramConn>,
) -> JoinHandle<Result<SendSummary, EngineError>> {
    let span = tracing::info_span!("sender", test_id = %test_id);
    tokio::spawn(
        async move {
            let outcome = send_stream(&params, conn.as_ref()).await;
            match &outcome {
                Ok(summary) => info!(
                    packets = summary.packets_sent,
                    late = summary.late_packets,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "send stream finished"
                ),
                Err(e) => warn!(error = %e, "send stream aborted"),
            }
            outcome
        }
        .instrument(span),
    )
}

/// Run [`receive_stream`] on its own task, recording into `slot`.
pub fn spawn_receiver(
    test_id: &str,
    params: TestParameters,
    conn: Arc<dyn DatagramConn>,
    slot: Arc<ResultSlot>,
) -> JoinHandle<ReceiveSummary> {
    let span = tracing::info_span!("receiver", test_id = %test_id);
    tokio::spawn(
        async move { receive_stream(&params, conn.as_ref(), &slot).await }.instrument(span),
    )
}
