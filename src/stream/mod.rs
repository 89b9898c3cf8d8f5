//! Score stream modules.
//!
//! - `negotiator`: websocket connect, grace window, and intent acceptance.
//! - `proto`: checkpoints, intents, events, and frame classification.
//! - `session`: the accepted session with its event sequence and suspend
//!   handshake.
//! - `recovery`: caller-selected recovery after an abrupt disconnect.

/// Session negotiation and connection options.
pub mod negotiator;
/// Wire-level types shared with the scores service.
pub mod proto;
/// Checkpoint bookkeeping and reconnect backoff.
pub mod recovery;
/// Active session, event sequence, and suspend.
pub mod session;

pub use negotiator::{
    CheckpointFrame, NegotiationError, PendingSession, SessionDefaults, SessionNegotiator,
    SessionOptions, LOCAL_ENDPOINT,
};
pub use proto::{Checkpoint, Event, Intent, PayloadKind, SubscriptionMode};
pub use recovery::{reopen_with_backoff, CheckpointLedger, ReconnectPolicy, RecoveryPolicy};
pub use session::{
    Events, SessionError, SessionStatus, StreamInterrupted, SubscriptionStream, SuspendError,
    Suspension,
};
