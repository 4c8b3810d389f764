//! Deadline-bounded packet receiver and verifier.
//!
//! Every datagram counts as received.  Only datagrams of exactly the
//! negotiated size whose payload matches the keyed stream at their embedded
//! offset count as correct.  Arrival order does not matter.

use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::ReceiveSummary;
use crate::params::TestParameters;
use crate::prg::PayloadGenerator;
use crate::sync::{ResultSlot, STRAGGLER_WAIT_PERIOD};
use crate::transport::DatagramConn;

/// Extra buffer space so oversized datagrams are seen at their real size.
const OVERSIZE_MARGIN: usize = 1000;

/// Pause after a non-timeout socket error.
const ERROR_BACKOFF: Duration = Duration::from_millis(1);

/// Receive one direction's stream until all packets arrived or the slot's
/// expected finish time passes, then freeze the counts in `slot`.
pub async fn receive_stream<C>(
    params: &TestParameters,
    conn: &C,
    slot: &ResultSlot,
) -> ReceiveSummary
where
    C: DatagramConn + ?Sized,
{
    let prg = PayloadGenerator::new(&params.auth_key);
    let mut recv_buf = vec![0u8; params.packet_size + OVERSIZE_MARGIN];
    let mut scratch = vec![0u8; params.packet_size];
    let expected = params.num_packets as u64;
    let mut packets_received: u64 = 0;
    let mut packets_correct: u64 = 0;
    let start = Instant::now();

    loop {
        // Re-read on every pass: the deadline may have been extended.
        let deadline = slot.expected_finish();
        if packets_received >= expected || Instant::now() >= deadline {
            break;
        }

        let len = match conn.recv_until(&mut recv_buf, deadline).await {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                trace!(error = %e, "receive error ignored");
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        if packets_received == 0 {
            slot.extend_finish(Instant::now() + params.duration + STRAGGLER_WAIT_PERIOD);
        }
        packets_received += 1;

        if len != params.packet_size {
            debug!(
                len,
                expected = params.packet_size,
                "packet has incorrect size"
            );
            continue;
        }

        if prg.verify_packet(&recv_buf[..len], &mut scratch) {
            packets_correct += 1;
        } else {
            trace!(packet = packets_received, "payload mismatch");
        }
    }

    slot.complete(packets_received, packets_correct);
    let elapsed = start.elapsed();

    info!(
        packets_received,
        packets_correct,
        expected,
        elapsed_ms = elapsed.as_millis() as u64,
        "receive stream finished"
    );

    ReceiveSummary {
        packets_received,
        packets_correct,
        elapsed,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
