//! Completion-time bookkeeping shared between a receive task and the
//! control plane.
//!
//! The receive task is the only writer of the counts; the expected finish
//! time may be pushed later by either side until the receive task completes.
//! Waiters are woken through a [`Notify`] whenever the record changes, so the
//! control plane never polls.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::params::{AuthKey, TestParameters, TestResult};

/// Bound on a control-channel round trip, also used as timing margin.
pub const MAX_RTT: Duration = Duration::from_secs(1);

/// Extra receive time on the responder before a direction is declared over.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Settling time after the initiator's last packet has been sent.
pub const GRACE_PERIOD_SEND: Duration = Duration::from_millis(10);

/// Extra receive time on the initiator for late packets.
pub const STRAGGLER_WAIT_PERIOD: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Time conversion
// ---------------------------------------------------------------------------

/// Wall-clock time of a monotonic instant.
pub fn to_wall(instant: Instant) -> DateTime<Utc> {
    let now = Instant::now();
    let wall = Utc::now();
    if instant >= now {
        wall + chrono::Duration::from_std(instant - now).unwrap_or(chrono::Duration::zero())
    } else {
        wall - chrono::Duration::from_std(now - instant).unwrap_or(chrono::Duration::zero())
    }
}

/// Monotonic instant of a wall-clock time; past times map to now.
pub fn to_instant(wall: DateTime<Utc>) -> Instant {
    let remaining = (wall - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}

/// Time left until `wall`, zero if it has passed.
pub fn remaining(wall: DateTime<Utc>) -> Duration {
    (wall - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Completion deadline
// ---------------------------------------------------------------------------

/// Instant by which both directions of a test started at `start` are done.
///
/// Covers the responder receiving the initiator's stream (`client_to_server`
/// plus round trip and send settling time) and the initiator receiving the
/// responder's stream (`server_to_client` plus round trip and straggler
/// wait), whichever ends later.  The directions overlap, so this is a
/// maximum, never a sum.
pub fn completion_deadline(
    start: Instant,
    client_to_server: &TestParameters,
    server_to_client: &TestParameters,
) -> Instant {
    let responder_done = start + client_to_server.duration + MAX_RTT + GRACE_PERIOD_SEND;
    let initiator_done = start + server_to_client.duration + MAX_RTT + STRAGGLER_WAIT_PERIOD;
    responder_done.max(initiator_done)
}

// ---------------------------------------------------------------------------
// ResultSlot
// ---------------------------------------------------------------------------

/// Lock-guarded [`TestResult`] of one direction plus a wake-up signal.
pub struct ResultSlot {
    result: Mutex<TestResult>,
    changed: Notify,
}

impl ResultSlot {
    /// Create a pending slot that expects to be final at `expected_finish`.
    pub fn new(auth_key: AuthKey, expected_finish: Instant) -> Self {
        Self {
            result: Mutex::new(TestResult::pending(auth_key, to_wall(expected_finish))),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TestResult> {
        // The record stays consistent even if a holder panicked mid-update:
        // every write is a single field assignment.
        self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> TestResult {
        self.lock().clone()
    }

    pub fn is_final(&self) -> bool {
        self.lock().is_final()
    }

    /// Current expected finish time as a monotonic instant.
    pub fn expected_finish(&self) -> Instant {
        to_instant(self.lock().expected_finish_time)
    }

    /// Push the expected finish time to `at` if that is later.
    ///
    /// Has no effect once the result is final.  Returns whether it moved.
    pub fn extend_finish(&self, at: Instant) -> bool {
        let at = to_wall(at);
        let moved = {
            let mut result = self.lock();
            if result.is_final() || result.expected_finish_time >= at {
                false
            } else {
                result.expected_finish_time = at;
                true
            }
        };
        if moved {
            debug!(expected_finish = %at, "expected finish time extended");
            self.changed.notify_waiters();
        }
        moved
    }

    /// Freeze the counts and stamp the completion time.
    pub fn complete(&self, packets_received: u64, packets_correct: u64) {
        {
            let mut result = self.lock();
            result.packets_received = Some(packets_received);
            result.packets_correct = Some(packets_correct);
            result.expected_finish_time = Utc::now();
        }
        self.changed.notify_waiters();
    }

    /// Wait until the result is final, or `limit` passes.
    ///
    /// Returns the record as it stands when the wait ends.
    pub async fn wait_final(&self, limit: Instant) -> TestResult {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.snapshot();
            if current.is_final() || Instant::now() >= limit {
                return current;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(limit) => {}
            }
        }
    }
}

/// Sleep until `floor` has passed and `slot`'s expected finish time is stable.
///
/// The receive task may extend the finish time while we sleep (for example
/// when the first packet arrives late), so the target is re-read after every
/// wake-up.  A final result no longer holds the wait open beyond `floor`.
pub async fn wait_until_settled(slot: &ResultSlot, floor: Instant) {
    loop {
        let notified = slot.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let target = if slot.is_final() {
            floor
        } else {
            floor.max(slot.expected_finish())
        };
        if Instant::now() >= target {
            return;
        }

        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep_until(target) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
