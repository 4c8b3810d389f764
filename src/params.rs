//! Test parameters and results exchanged between initiator and responder.
//!
//! One [`TestParameters`] describes a single direction of a bandwidth test
//! (client->server or server->client).  The receiving side of each direction
//! produces one [`TestResult`].  The per-test [`AuthKey`] seeds the keyed
//! payload generator and doubles as the lookup token for result retrieval.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest test a single direction may run.
pub const MAX_DURATION: Duration = Duration::from_secs(10);

/// Smallest packet: the 4-byte offset field must fit.
pub const MIN_PACKET_SIZE: usize = 4;

/// Largest packet, large enough for jumbo frames.
pub const MAX_PACKET_SIZE: usize = 66_000;

/// Length of the per-test secret (AES-128 key).
pub const AUTH_KEY_LEN: usize = 16;

/// Direction spec used when none is given: 3 seconds, 1000 bytes, 30 packets.
pub const DEFAULT_DIRECTION_SPEC: &str = "3,1000,30";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while building or validating test parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("direction spec '{0}' must have the form duration,packet_size,num_packets")]
    Malformed(String),

    #[error("invalid number '{value}' in direction spec")]
    InvalidNumber { value: String },

    #[error("duration must be positive")]
    ZeroDuration,

    #[error("duration {requested:?} exceeds the maximum of {max:?}")]
    DurationTooLong { requested: Duration, max: Duration },

    #[error("number of packets must be positive")]
    ZeroPackets,

    #[error("{requested} packets exceed the maximum of {max}")]
    TooManyPackets { requested: u64, max: u64 },

    #[error("authentication key must be {expected} bytes, got {actual}")]
    KeyLength { expected: usize, actual: usize },

    #[error("failed to obtain random key material: {0}")]
    KeyGeneration(String),
}

// ---------------------------------------------------------------------------
// AuthKey
// ---------------------------------------------------------------------------

/// Per-test secret.  Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct AuthKey([u8; AUTH_KEY_LEN]);

impl AuthKey {
    /// Draw a fresh key from the operating system RNG.
    pub fn generate() -> Result<Self, ParamError> {
        let mut bytes = [0u8; AUTH_KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| ParamError::KeyGeneration(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; AUTH_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, which must be exactly [`AUTH_KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParamError> {
        let arr: [u8; AUTH_KEY_LEN] = bytes.try_into().map_err(|_| ParamError::KeyLength {
            expected: AUTH_KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] {
        &self.0
    }

    /// Short, non-secret tag for log lines (first two bytes, hex).
    pub fn fingerprint(&self) -> String {
        format!("{:02x}{:02x}", self.0[0], self.0[1])
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey({}..)", self.fingerprint())
    }
}

// ---------------------------------------------------------------------------
// TestParameters
// ---------------------------------------------------------------------------

/// Configuration of one direction of a bandwidth test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestParameters {
    /// How long the sender spreads its packets over.
    pub duration: Duration,
    /// Size of every packet in bytes.
    pub packet_size: usize,
    /// Number of packets to send over `duration`.
    pub num_packets: usize,
    /// Per-test secret for payload generation and result lookup.
    pub auth_key: AuthKey,
    /// Data-channel port of the endpoint receiving this direction.
    pub port: u16,
}

impl TestParameters {
    /// Ideal gap between two consecutive packets.
    pub fn interval(&self) -> Duration {
        self.send_offset(1)
    }

    /// Ideal send time of packet `index`, relative to the start of the test.
    pub fn send_offset(&self, index: usize) -> Duration {
        let nanos = self.duration.as_nanos() * index as u128 / self.num_packets.max(1) as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Clamp values received from an untrusted peer into the supported range.
    ///
    /// Returns `None` when the record cannot describe a meaningful test.
    pub fn sanitized(mut self) -> Option<Self> {
        if self.duration.is_zero() || self.num_packets == 0 {
            return None;
        }
        self.duration = self.duration.min(MAX_DURATION);
        self.packet_size = self.packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        Some(self)
    }

    /// Total number of payload bytes this direction sends.
    pub fn total_bytes(&self) -> u64 {
        self.packet_size as u64 * self.num_packets as u64
    }
}

// ---------------------------------------------------------------------------
// DirectionSpec
// ---------------------------------------------------------------------------

/// User-facing `duration,packet_size,num_packets` description of a direction.
///
/// Durations are whole seconds.  Packet sizes outside the supported range are
/// clamped; a zero or over-long duration and a zero packet count are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirectionSpec {
    pub duration: Duration,
    pub packet_size: usize,
    pub num_packets: usize,
}

impl DirectionSpec {
    /// Turn the spec into parameters with a freshly generated key.
    pub fn into_parameters(self, port: u16) -> Result<TestParameters, ParamError> {
        Ok(TestParameters {
            duration: self.duration,
            packet_size: self.packet_size,
            num_packets: self.num_packets,
            auth_key: AuthKey::generate()?,
            port,
        })
    }
}

impl Default for DirectionSpec {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3),
            packet_size: 1000,
            num_packets: 30,
        }
    }
}

impl FromStr for DirectionSpec {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(ParamError::Malformed(s.to_string()));
        }

        let number = |value: &str| -> Result<u64, ParamError> {
            value.parse::<u64>().map_err(|_| ParamError::InvalidNumber {
                value: value.to_string(),
            })
        };

        let duration = Duration::from_secs(number(fields[0])?);
        if duration.is_zero() {
            return Err(ParamError::ZeroDuration);
        }
        if duration > MAX_DURATION {
            return Err(ParamError::DurationTooLong {
                requested: duration,
                max: MAX_DURATION,
            });
        }

        let packet_size = usize::try_from(number(fields[1])?)
            .unwrap_or(MAX_PACKET_SIZE)
            .clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE);

        let requested = number(fields[2])?;
        if requested == 0 {
            return Err(ParamError::ZeroPackets);
        }
        // The packet count travels as a u32.
        let num_packets = u32::try_from(requested)
            .ok()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(ParamError::TooManyPackets {
                requested,
                max: u64::from(u32::MAX),
            })?;

        Ok(Self {
            duration,
            packet_size,
            num_packets,
        })
    }
}

impl fmt::Display for DirectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} seconds, {} bytes, {} packets",
            self.duration.as_secs(),
            self.packet_size,
            self.num_packets
        )
    }
}

// ---------------------------------------------------------------------------
// TestResult
// ---------------------------------------------------------------------------

/// Measurement produced by the receiving side of one direction.
///
/// Counts stay `None` while the receive task is still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    /// Datagrams observed, regardless of correctness.
    pub packets_received: Option<u64>,
    /// Datagrams that passed integrity verification.
    pub packets_correct: Option<u64>,
    /// Echo of the originating parameters' key.
    pub auth_key: AuthKey,
    /// Instant after which the result is expected to be final.
    pub expected_finish_time: DateTime<Utc>,
}

impl TestResult {
    /// A result whose counts are not known yet.
    pub fn pending(auth_key: AuthKey, expected_finish_time: DateTime<Utc>) -> Self {
        Self {
            packets_received: None,
            packets_correct: None,
            auth_key,
            expected_finish_time,
        }
    }

    /// Whether the receive task has exited and frozen the counts.
    pub fn is_final(&self) -> bool {
        self.packets_received.is_some() && self.packets_correct.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_direction_spec() {
        let spec: DirectionSpec = "5,1000,5".parse().unwrap();
        assert_eq!(spec.duration, Duration::from_secs(5));
        assert_eq!(spec.packet_size, 1000);
        assert_eq!(spec.num_packets, 5);
    }

    #[test]
    fn test_default_matches_default_spec_string() {
        let parsed: DirectionSpec = DEFAULT_DIRECTION_SPEC.parse().unwrap();
        assert_eq!(parsed, DirectionSpec::default());
    }

    #[test]
    fn test_packet_size_is_clamped() {
        let small: DirectionSpec = "1,1,10".parse().unwrap();
        assert_eq!(small.packet_size, MIN_PACKET_SIZE);

        let large: DirectionSpec = "1,100000,10".parse().unwrap();
        assert_eq!(large.packet_size, MAX_PACKET_SIZE);
    }

    #[test]
    fn test_duration_over_maximum_is_rejected() {
        let err = "11,1000,10".parse::<DirectionSpec>().unwrap_err();
        assert!(matches!(err, ParamError::DurationTooLong { .. }));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        assert_eq!(
            "0,1000,10".parse::<DirectionSpec>().unwrap_err(),
            ParamError::ZeroDuration
        );
        assert_eq!(
            "3,1000,0".parse::<DirectionSpec>().unwrap_err(),
            ParamError::ZeroPackets
        );
    }

    #[test]
    fn test_packet_count_must_fit_the_wire() {
        assert_eq!(
            "3,1000,5000000000".parse::<DirectionSpec>().unwrap_err(),
            ParamError::TooManyPackets {
                requested: 5_000_000_000,
                max: u64::from(u32::MAX),
            }
        );

        let largest: DirectionSpec = "3,1000,4294967295".parse().unwrap();
        assert_eq!(largest.num_packets as u64, u64::from(u32::MAX));
    }

    #[test]
    fn test_malformed_specs() {
        assert!(matches!(
            "3,1000".parse::<DirectionSpec>(),
            Err(ParamError::Malformed(_))
        ));
        assert!(matches!(
            "3,-5,10".parse::<DirectionSpec>(),
            Err(ParamError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = AuthKey::generate().unwrap();
        let b = AuthKey::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_from_slice_checks_length() {
        assert!(AuthKey::from_slice(&[0u8; AUTH_KEY_LEN]).is_ok());
        assert_eq!(
            AuthKey::from_slice(&[0u8; 3]).unwrap_err(),
            ParamError::KeyLength {
                expected: AUTH_KEY_LEN,
                actual: 3
            }
        );
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = AuthKey::from_bytes([0xab; AUTH_KEY_LEN]);
        assert_eq!(format!("{:?}", key), "AuthKey(abab..)");
    }

    #[test]
    fn test_sanitized_clamps_and_rejects() {
        let params = TestParameters {
            duration: Duration::from_secs(60),
            packet_size: 1,
            num_packets: 10,
            auth_key: AuthKey::from_bytes([1; AUTH_KEY_LEN]),
            port: 40003,
        };
        let clean = params.clone().sanitized().unwrap();
        assert_eq!(clean.duration, MAX_DURATION);
        assert_eq!(clean.packet_size, MIN_PACKET_SIZE);

        let empty = TestParameters {
            num_packets: 0,
            ..params
        };
        assert!(empty.sanitized().is_none());
    }

    #[test]
    fn test_interval() {
        let params = DirectionSpec {
            duration: Duration::from_secs(3),
            packet_size: 1000,
            num_packets: 30,
        }
        .into_parameters(0)
        .unwrap();
        assert_eq!(params.interval(), Duration::from_millis(100));
        assert_eq!(params.total_bytes(), 30_000);
    }

    #[test]
    fn test_pending_result_is_not_final() {
        let result = TestResult::pending(AuthKey::from_bytes([2; AUTH_KEY_LEN]), Utc::now());
        assert!(!result.is_final());
    }
}
