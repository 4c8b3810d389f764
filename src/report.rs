//! Bandwidth and loss reporting for finished tests.

use std::fmt;

use serde::Serialize;

use crate::params::{TestParameters, TestResult};

/// Which way a stream flowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "C->S"),
            Direction::ServerToClient => write!(f, "S->C"),
        }
    }
}

/// Measured outcome of one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectionReport {
    pub direction: Direction,
    pub duration_secs: f64,
    pub packet_size: usize,
    pub num_packets: usize,
    /// `None` when the receiver never finished.
    pub packets_received: Option<u64>,
    pub packets_correct: Option<u64>,
    pub attempted_bps: f64,
    pub achieved_bps: f64,
    pub loss_percent: f64,
}

impl DirectionReport {
    pub fn new(direction: Direction, params: &TestParameters, result: &TestResult) -> Self {
        let duration_secs = params.duration.as_secs_f64();
        let correct = result.packets_correct.unwrap_or(0);
        let bits_per_packet = 8.0 * params.packet_size as f64;
        let rate = |packets: f64| {
            if duration_secs > 0.0 {
                bits_per_packet * packets / duration_secs
            } else {
                0.0
            }
        };
        let loss_percent = if params.num_packets == 0 {
            0.0
        } else {
            let lost = params.num_packets as f64 - (correct as f64).min(params.num_packets as f64);
            lost / params.num_packets as f64 * 100.0
        };

        Self {
            direction,
            duration_secs,
            packet_size: params.packet_size,
            num_packets: params.num_packets,
            packets_received: result.packets_received,
            packets_correct: result.packets_correct,
            attempted_bps: rate(params.num_packets as f64),
            achieved_bps: rate(correct as f64),
            loss_percent,
        }
    }
}

/// Both directions of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub server_to_client: DirectionReport,
    /// Missing when the responder's measurement could not be retrieved.
    pub client_to_server: Option<DirectionReport>,
    pub failure: Option<String>,
}

impl TestReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.client_to_server.is_some()
    }
}

/// Human-readable bandwidth, switching to Gbps at 1000 Mbps.
pub fn format_bandwidth(bps: f64) -> String {
    let mbps = bps / 1e6;
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.3} Mbps", mbps)
    }
}

/// Multi-line summary of one direction.
pub fn format_summary(report: &DirectionReport) -> String {
    let mut summary = format!(
        "{} results ({:.0}s, {} x {} bytes)\n",
        report.direction, report.duration_secs, report.num_packets, report.packet_size
    );
    summary.push_str(&format!(
        "  Attempted bandwidth: {:.0} bps / {}\n",
        report.attempted_bps,
        format_bandwidth(report.attempted_bps)
    ));
    summary.push_str(&format!(
        "  Achieved bandwidth:  {:.0} bps / {}\n",
        report.achieved_bps,
        format_bandwidth(report.achieved_bps)
    ));
    match (report.packets_received, report.packets_correct) {
        (Some(received), Some(correct)) => summary.push_str(&format!(
            "  Packets: {} received, {} correct\n",
            received, correct
        )),
        _ => summary.push_str("  Packets: receiver did not finish\n"),
    }
    summary.push_str(&format!("  Loss rate: {:.1}%", report.loss_percent));
    summary
}
