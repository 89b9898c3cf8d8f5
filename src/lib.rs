//! Resumable websocket client for the scores event stream.
//!
//! A session starts with an intent: `"connect"` for a fresh subscription or a
//! checkpoint from an earlier session to resume after it. Events are consumed
//! as a cancellable stream. Suspending sends `"disconnect"` and yields the
//! checkpoint for the next session. Delivery is at-least-once.
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use scores_stream_sdk::stream::{Intent, SessionNegotiator};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = SessionNegotiator::local().open(Intent::Fresh).await?;
//! {
//!     let mut events = session.events()?;
//!     if let Some(event) = events.next().await {
//!         println!("{:?}", event?.as_text());
//!     }
//! }
//! let suspension = session.suspend().await?;
//! let _resumed = SessionNegotiator::local()
//!     .open(suspension.into_intent())
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Session negotiation, event consumption, and recovery.
pub mod stream;
