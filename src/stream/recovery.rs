//! Caller-side recovery policies.
//!
//! Sessions never reconnect on their own. When a suspend is not graceful
//! there is no fresh checkpoint, and only the application knows whether it
//! would rather see duplicates or lose events. The helpers here let it say so
//! explicitly.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::stream::negotiator::{NegotiationError, SessionNegotiator};
use crate::stream::proto::{Checkpoint, Intent};
use crate::stream::session::{SubscriptionStream, SuspendError, Suspension};

/// What to do when a session ends without handing out a checkpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RecoveryPolicy {
    /// Resume from the last checkpoint a graceful suspend produced. Events
    /// delivered since then are delivered again.
    #[default]
    ResumeLastCheckpoint,
    /// Start a fresh subscription. Events produced while disconnected may be
    /// missed.
    RestartFresh,
}

/// Remembers the most recent checkpoint obtained from a graceful suspend.
#[derive(Clone, Debug, Default)]
pub struct CheckpointLedger {
    last: Option<Checkpoint>,
}

impl CheckpointLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger seeded from a checkpoint the application persisted earlier.
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            last: Some(checkpoint),
        }
    }

    pub fn last(&self) -> Option<&Checkpoint> {
        self.last.as_ref()
    }

    pub fn record(&mut self, checkpoint: Checkpoint) {
        self.last = Some(checkpoint);
    }

    /// Intent for the next session after an abrupt end.
    pub fn intent_for(&self, policy: RecoveryPolicy) -> Intent {
        match (policy, &self.last) {
            (RecoveryPolicy::ResumeLastCheckpoint, Some(checkpoint)) => {
                Intent::Resume(checkpoint.clone())
            }
            _ => Intent::Fresh,
        }
    }

    /// Records the outcome of a suspend and picks the next intent.
    ///
    /// A graceful suspend always resumes from its new checkpoint. Otherwise
    /// `policy` decides.
    pub fn next_intent(
        &mut self,
        outcome: &Result<Suspension, SuspendError>,
        policy: RecoveryPolicy,
    ) -> Intent {
        match outcome {
            Ok(suspension) => {
                self.record(suspension.checkpoint.clone());
                Intent::Resume(suspension.checkpoint.clone())
            }
            Err(err) => {
                debug!(event = "recovery_policy_applied", ?policy, error = %err);
                self.intent_for(policy)
            }
        }
    }
}

/// Backoff schedule for [`reopen_with_backoff`].
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Attempts including the first one.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// A single attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Suited to a long-running consumer riding out short outages.
    pub fn patient() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            jitter: Duration::from_millis(100),
        }
    }

    /// Delay after the failed `attempt` (1-based).
    pub fn backoff_after(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(32) as u32;
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_backoff);
        base + jitter(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::patient()
    }
}

/// Opens a session, retrying failures where the server never saw the
/// intent.
///
/// `negotiator` is called once per attempt since opening spends it. Rejected
/// intents and grace window violations are returned immediately.
pub async fn reopen_with_backoff<F>(
    policy: &ReconnectPolicy,
    mut negotiator: F,
    intent: Intent,
) -> Result<SubscriptionStream, NegotiationError>
where
    F: FnMut() -> SessionNegotiator,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match negotiator().open(intent.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(err) => err,
        };

        if attempt >= max_attempts || !err.is_transport() {
            return Err(err);
        }

        let delay = policy.backoff_after(attempt);
        debug!(
            event = "reconnect_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn jitter(limit: Duration, attempt: usize) -> Duration {
    let limit_nanos = limit.as_nanos().min(u128::from(u64::MAX)) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = clock ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
