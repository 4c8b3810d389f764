//! Binary codec for the control channel.
//!
//! Control messages start with a one-byte tag (`'N'` for new-test traffic,
//! `'R'` for result retrieval).  Multi-byte fields are big-endian.
//!
//! ```text
//! TestParameters (34 bytes)
//!   duration_ns: u64 | packet_size: u32 | num_packets: u32 | key: [u8; 16] | port: u16
//!
//! TestResult (40 bytes)
//!   received: u64 | correct: u64 | key: [u8; 16] | expected_finish_ms: i64
//!   (u64::MAX marks a count that is not known yet)
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::params::{AuthKey, TestParameters, TestResult, AUTH_KEY_LEN};

/// Tag of new-test requests and replies.
pub const TAG_NEW_TEST: u8 = b'N';

/// Tag of result requests and replies.
pub const TAG_RESULT: u8 = b'R';

/// Status byte signalling success.
pub const STATUS_OK: u8 = 0;

/// Status byte signalling that no result exists for the presented key.
pub const STATUS_NOT_FOUND: u8 = 127;

/// Largest retry-after value a status byte may carry.
pub const MAX_RETRY_AFTER_SECS: u8 = STATUS_NOT_FOUND - 1;

/// Encoded size of [`TestParameters`].
pub const PARAMETERS_LEN: usize = 8 + 4 + 4 + AUTH_KEY_LEN + 2;

/// Encoded size of [`TestResult`].
pub const RESULT_LEN: usize = 8 + 8 + AUTH_KEY_LEN + 8;

/// Upper bound on any control message, used to size receive buffers.
pub const MAX_CONTROL_MESSAGE_LEN: usize = 1 + 2 * PARAMETERS_LEN;

const UNKNOWN_COUNT: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while decoding control-channel bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated {what}: need {needed} bytes, have {have}")]
    Truncated {
        what: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("field {field} out of range")]
    OutOfRange { field: &'static str },
}

fn ensure(what: &'static str, buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            what,
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

fn get_key(buf: &mut &[u8]) -> AuthKey {
    let mut key = [0u8; AUTH_KEY_LEN];
    buf.copy_to_slice(&mut key);
    AuthKey::from_bytes(key)
}

// ---------------------------------------------------------------------------
// Record codecs
// ---------------------------------------------------------------------------

/// Append the encoding of `params` to `dst`.
pub fn encode_parameters(params: &TestParameters, dst: &mut BytesMut) {
    dst.reserve(PARAMETERS_LEN);
    dst.put_u64(u64::try_from(params.duration.as_nanos()).unwrap_or(u64::MAX));
    dst.put_u32(u32::try_from(params.packet_size).unwrap_or(u32::MAX));
    dst.put_u32(u32::try_from(params.num_packets).unwrap_or(u32::MAX));
    dst.put_slice(params.auth_key.as_bytes());
    dst.put_u16(params.port);
}

/// Decode parameters from the front of `src`, returning the bytes consumed.
pub fn decode_parameters(src: &[u8]) -> Result<(TestParameters, usize), WireError> {
    ensure("test parameters", src, PARAMETERS_LEN)?;
    let mut buf = &src[..PARAMETERS_LEN];
    let duration = Duration::from_nanos(buf.get_u64());
    let packet_size = buf.get_u32() as usize;
    let num_packets = buf.get_u32() as usize;
    let auth_key = get_key(&mut buf);
    let port = buf.get_u16();

    Ok((
        TestParameters {
            duration,
            packet_size,
            num_packets,
            auth_key,
            port,
        },
        PARAMETERS_LEN,
    ))
}

/// Append the encoding of `result` to `dst`.
pub fn encode_result(result: &TestResult, dst: &mut BytesMut) {
    dst.reserve(RESULT_LEN);
    dst.put_u64(result.packets_received.unwrap_or(UNKNOWN_COUNT));
    dst.put_u64(result.packets_correct.unwrap_or(UNKNOWN_COUNT));
    dst.put_slice(result.auth_key.as_bytes());
    dst.put_i64(result.expected_finish_time.timestamp_millis());
}

/// Decode a result from the front of `src`, returning the bytes consumed.
pub fn decode_result(src: &[u8]) -> Result<(TestResult, usize), WireError> {
    ensure("test result", src, RESULT_LEN)?;
    let mut buf = &src[..RESULT_LEN];
    let known = |count: u64| (count != UNKNOWN_COUNT).then_some(count);
    let packets_received = known(buf.get_u64());
    let packets_correct = known(buf.get_u64());
    let auth_key = get_key(&mut buf);
    let expected_finish_time = DateTime::<Utc>::from_timestamp_millis(buf.get_i64()).ok_or(
        WireError::OutOfRange {
            field: "expected_finish_time",
        },
    )?;

    Ok((
        TestResult {
            packets_received,
            packets_correct,
            auth_key,
            expected_finish_time,
        },
        RESULT_LEN,
    ))
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Status carried by new-test and result replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// Request accepted / result attached.
    Ok,
    /// The responder asks the initiator to come back after this many seconds.
    RetryAfter(u8),
    /// The key is unknown to the responder (result replies only).
    NotFound,
}

impl ReplyStatus {
    /// Retry-after status for `wait`, rounded up and clamped to `1..=126` seconds.
    pub fn retry_after(wait: Duration) -> Self {
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        let secs = secs.clamp(1, u64::from(MAX_RETRY_AFTER_SECS)) as u8;
        ReplyStatus::RetryAfter(secs)
    }

    fn to_byte(self) -> u8 {
        match self {
            ReplyStatus::Ok => STATUS_OK,
            ReplyStatus::RetryAfter(secs) => secs.clamp(1, MAX_RETRY_AFTER_SECS),
            ReplyStatus::NotFound => STATUS_NOT_FOUND,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            STATUS_OK => ReplyStatus::Ok,
            STATUS_NOT_FOUND => ReplyStatus::NotFound,
            secs => ReplyStatus::RetryAfter(secs),
        }
    }
}

/// Every message exchanged on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `'N' || client->server params || server->client params`
    NewTest {
        client_to_server: TestParameters,
        server_to_client: TestParameters,
    },
    /// `'N' || status`
    NewTestReply(ReplyStatus),
    /// `'R' || key`
    ResultRequest(AuthKey),
    /// `'R' || status [|| result]`; the result is present only with `Ok`.
    ResultReply {
        status: ReplyStatus,
        result: Option<TestResult>,
    },
}

/// Which side of the exchange a datagram came from.
///
/// The same tags are used in both directions, so the decoder needs to know
/// whether it is looking at a request or a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Reply,
}

impl ControlMessage {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_CONTROL_MESSAGE_LEN.max(2 + RESULT_LEN));
        match self {
            ControlMessage::NewTest {
                client_to_server,
                server_to_client,
            } => {
                buf.put_u8(TAG_NEW_TEST);
                encode_parameters(client_to_server, &mut buf);
                encode_parameters(server_to_client, &mut buf);
            }
            ControlMessage::NewTestReply(status) => {
                buf.put_u8(TAG_NEW_TEST);
                buf.put_u8(status.to_byte());
            }
            ControlMessage::ResultRequest(key) => {
                buf.put_u8(TAG_RESULT);
                buf.put_slice(key.as_bytes());
            }
            ControlMessage::ResultReply { status, result } => {
                buf.put_u8(TAG_RESULT);
                match (status, result) {
                    (ReplyStatus::Ok, Some(result)) => {
                        buf.put_u8(STATUS_OK);
                        encode_result(result, &mut buf);
                    }
                    // A success status without a record cannot be decoded by
                    // the peer, so it goes out as not-found.
                    (ReplyStatus::Ok, None) => buf.put_u8(STATUS_NOT_FOUND),
                    (status, _) => buf.put_u8(status.to_byte()),
                }
            }
        }
        buf.freeze()
    }

    /// Decode one datagram.  Trailing bytes beyond the message are ignored.
    pub fn decode(role: Role, src: &[u8]) -> Result<Self, WireError> {
        let (&tag, body) = src.split_first().ok_or(WireError::Truncated {
            what: "message tag",
            needed: 1,
            have: 0,
        })?;

        match (role, tag) {
            (Role::Request, TAG_NEW_TEST) => {
                let (client_to_server, used) = decode_parameters(body)?;
                let (server_to_client, _) = decode_parameters(&body[used..])?;
                Ok(ControlMessage::NewTest {
                    client_to_server,
                    server_to_client,
                })
            }
            (Role::Request, TAG_RESULT) => {
                ensure("result request", body, AUTH_KEY_LEN)?;
                let mut buf = body;
                Ok(ControlMessage::ResultRequest(get_key(&mut buf)))
            }
            (Role::Reply, TAG_NEW_TEST) => {
                ensure("new-test reply", body, 1)?;
                // Not-found is a result-reply status; here every nonzero
                // byte is a wait in seconds.
                let status = match body[0] {
                    STATUS_OK => ReplyStatus::Ok,
                    secs => ReplyStatus::RetryAfter(secs),
                };
                Ok(ControlMessage::NewTestReply(status))
            }
            (Role::Reply, TAG_RESULT) => {
                ensure("result reply", body, 1)?;
                let status = ReplyStatus::from_byte(body[0]);
                let result = match status {
                    ReplyStatus::Ok => Some(decode_result(&body[1..])?.0),
                    _ => None,
                };
                Ok(ControlMessage::ResultReply { status, result })
            }
            (_, other) => Err(WireError::UnknownTag(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
