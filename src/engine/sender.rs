//! Paced packet sender.
//!
//! Packet `i` is due at `start + i * duration / num_packets`.  An early
//! sender sleeps until the packet is due; a late one sends at once and does
//! not try to win the time back by bursting.

use tokio::time::Instant;
use tracing::{debug, trace};

use super::{EngineError, SendSummary};
use crate::params::TestParameters;
use crate::prg::PayloadGenerator;
use crate::transport::DatagramConn;

/// Send `params.num_packets` keyed packets over `conn`.
///
/// A failed or short write aborts the stream; there is no retry at this layer.
pub async fn send_stream<C>(params: &TestParameters, conn: &C) -> Result<SendSummary, EngineError>
where
    C: DatagramConn + ?Sized,
{
    let prg = PayloadGenerator::new(&params.auth_key);
    let mut packet = vec![0u8; params.packet_size];
    let mut late_packets = 0;
    let start = Instant::now();

    debug!(
        packets = params.num_packets,
        packet_size = params.packet_size,
        interval_us = params.interval().as_micros() as u64,
        "starting send stream"
    );

    for index in 0..params.num_packets {
        let due = start + params.send_offset(index);
        if Instant::now() < due {
            tokio::time::sleep_until(due).await;
        } else if index > 0 {
            late_packets += 1;
            trace!(index, behind_us = due.elapsed().as_micros() as u64, "sending late");
        }

        // The offset field is 32 bits wide and wraps on very long streams.
        let offset = (index as u64).wrapping_mul(params.packet_size as u64) as u32;
        prg.fill_packet(offset, &mut packet);

        let written = conn
            .send(&packet)
            .await
            .map_err(|source| EngineError::Send { index, source })?;
        if written < params.packet_size {
            return Err(EngineError::ShortWrite {
                index,
                written,
                expected: params.packet_size,
            });
        }
    }

    Ok(SendSummary {
        packets_sent: params.num_packets,
        late_packets,
        elapsed: start.elapsed(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{AuthKey, AUTH_KEY_LEN};
    use crate::prg::read_offset;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every datagram together with the time it was handed over.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Instant, Vec<u8>)>>,
        truncate_to: Option<usize>,
    }

    #[async_trait]
    impl DatagramConn for Recorder {
        async fn send(&self, buf: &[u8]) -> io::Result<usize> {
            self.sent.lock().unwrap().push((Instant::now(), buf.to_vec()));
            Ok(self.truncate_to.unwrap_or(buf.len()).min(buf.len()))
        }

        async fn recv_until(&self, _buf: &mut [u8], _deadline: Instant) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "recorder never receives"))
        }
    }

    fn params(duration_ms: u64, packet_size: usize, num_packets: usize) -> TestParameters {
        TestParameters {
            duration: Duration::from_millis(duration_ms),
            packet_size,
            num_packets,
            auth_key: AuthKey::from_bytes([6; AUTH_KEY_LEN]),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_sends_exact_count_with_offsets() {
        let conn = Recorder::default();
        let p = params(200, 100, 5);
        let summary = send_stream(&p, &conn).await.expect("send");
        assert_eq!(summary.packets_sent, 5);

        let sent = conn.sent.lock().unwrap();
        assert_eq!(sent.len(), 5);
        for (i, (_, packet)) in sent.iter().enumerate() {
            assert_eq!(packet.len(), 100);
            assert_eq!(read_offset(packet), Some((i * 100) as u32));
        }
    }

    #[tokio::test]
    async fn test_packets_are_paced() {
        let conn = Recorder::default();
        let p = params(400, 64, 4);
        let summary = send_stream(&p, &conn).await.expect("send");

        // Last packet is due at 3/4 of the duration.
        assert!(summary.elapsed >= Duration::from_millis(290));
        let sent = conn.sent.lock().unwrap();
        let first = sent[0].0;
        for (i, (at, _)) in sent.iter().enumerate() {
            let ideal = Duration::from_millis(100 * i as u64);
            assert!(
                at.duration_since(first) + Duration::from_millis(5) >= ideal,
                "packet {} sent too early",
                i
            );
        }
    }

    #[tokio::test]
    async fn test_packets_verify_against_same_key() {
        let conn = Recorder::default();
        let p = params(50, 256, 3);
        send_stream(&p, &conn).await.expect("send");

        let prg = PayloadGenerator::new(&p.auth_key);
        let mut scratch = vec![0u8; 256];
        for (_, packet) in conn.sent.lock().unwrap().iter() {
            assert!(prg.verify_packet(packet, &mut scratch));
        }
    }

    #[tokio::test]
    async fn test_short_write_aborts() {
        let conn = Recorder {
            truncate_to: Some(10),
            ..Default::default()
        };
        let err = send_stream(&params(50, 100, 3), &conn).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::ShortWrite {
                index: 0,
                written: 10,
                expected: 100
            }
        ));
        assert_eq!(conn.sent.lock().unwrap().len(), 1);
    }
}
