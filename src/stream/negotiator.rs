//! Session negotiation: transport connect, intent, and acceptance.
//!
//! A [`SessionNegotiator`] is spent by opening one session. Opening connects
//! the websocket, sends the intent within the grace window, and watches the
//! connection for an acceptance window before handing it to a
//! [`SubscriptionStream`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::stream::proto::{classify, Frame, Intent, PayloadKind};
use crate::stream::session::{SessionStatus, StatusCell, StreamInterrupted, SubscriptionStream};

pub(crate) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Endpoint of a scores websocket service running on the local machine.
pub const LOCAL_ENDPOINT: &str = "ws://127.0.0.1:7727";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    /// Upper bound for the websocket handshake.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Time the service waits for the intent before dropping the connection.
    pub const GRACE_WINDOW: Duration = Duration::from_secs(5);
    /// Time after the intent during which a bare close means rejection.
    pub const ACCEPTANCE_WINDOW: Duration = Duration::from_millis(250);
    /// Upper bound for the whole disconnect handshake.
    pub const SUSPEND_TIMEOUT: Duration = Duration::from_secs(10);
    /// Events buffered between the socket worker and the consumer.
    pub const EVENT_BUFFER: usize = 1024;
}

/// How the checkpoint is picked out of the frames that follow `"disconnect"`.
///
/// The service sends no marker on the checkpoint. With [`AnyData`], an event
/// the server wrote before it saw `"disconnect"` is taken as the checkpoint:
/// that event is lost and the checkpoint holds its payload. Use [`TextOnly`]
/// when events travel as binary frames.
///
/// [`AnyData`]: CheckpointFrame::AnyData
/// [`TextOnly`]: CheckpointFrame::TextOnly
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CheckpointFrame {
    /// The first data frame is the checkpoint.
    #[default]
    AnyData,
    /// The first text frame is the checkpoint. Binary frames still in flight
    /// are kept as undelivered events.
    TextOnly,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Upper bound for the websocket handshake.
    pub connect_timeout: Duration,
    /// Time allowed between transport establishment and the intent.
    pub grace_window: Duration,
    /// Time after the intent during which a server close counts as rejection.
    /// Zero accepts as soon as the intent is sent.
    pub acceptance_window: Duration,
    /// Time allowed for the disconnect handshake, close included.
    pub suspend_timeout: Duration,
    /// Capacity of the channel between the socket worker and the consumer.
    pub event_buffer: usize,
    /// Which frame after `"disconnect"` carries the checkpoint.
    pub checkpoint_frame: CheckpointFrame,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionDefaults::CONNECT_TIMEOUT,
            grace_window: SessionDefaults::GRACE_WINDOW,
            acceptance_window: SessionDefaults::ACCEPTANCE_WINDOW,
            suspend_timeout: SessionDefaults::SUSPEND_TIMEOUT,
            event_buffer: SessionDefaults::EVENT_BUFFER,
            checkpoint_frame: CheckpointFrame::default(),
        }
    }
}

/// Opens exactly one subscription session.
#[derive(Clone, Debug)]
pub struct SessionNegotiator {
    endpoint: String,
    options: SessionOptions,
}

impl SessionNegotiator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end().to_string(),
            options: SessionOptions::default(),
        }
    }

    /// Negotiator for [`LOCAL_ENDPOINT`].
    pub fn local() -> Self {
        Self::new(LOCAL_ENDPOINT)
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn with_grace_window(mut self, window: Duration) -> Self {
        self.options.grace_window = window;
        self
    }

    pub fn with_acceptance_window(mut self, window: Duration) -> Self {
        self.options.acceptance_window = window;
        self
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.options.suspend_timeout = timeout;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.options.event_buffer = capacity;
        self
    }

    pub fn with_checkpoint_frame(mut self, frame: CheckpointFrame) -> Self {
        self.options.checkpoint_frame = frame;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Connects, sends `intent` and waits for acceptance.
    ///
    /// Nothing is retried here; see [`crate::stream::recovery`] for
    /// caller-side policies.
    pub async fn open(self, intent: Intent) -> Result<SubscriptionStream, NegotiationError> {
        validate_intent(&intent)?;
        self.connect().await?.send_intent(intent).await
    }

    /// Establishes the transport only. The grace window starts now.
    pub async fn connect(self) -> Result<PendingSession, NegotiationError> {
        let request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| NegotiationError::InvalidEndpoint(err.to_string()))?;

        match request.uri().scheme_str() {
            Some("ws" | "wss") => {}
            other => {
                return Err(NegotiationError::InvalidEndpoint(format!(
                    "unsupported scheme {other:?}, expected ws or wss"
                )));
            }
        }

        let connect = tokio::time::timeout(self.options.connect_timeout, connect_async(request));
        let socket = match connect.await {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(err)) => {
                warn!(event = "transport_refused", endpoint = %self.endpoint, error = %err);
                return Err(NegotiationError::Transport(err));
            }
            Err(_) => return Err(NegotiationError::ConnectTimeout(self.options.connect_timeout)),
        };

        debug!(event = "transport_connected", endpoint = %self.endpoint);

        Ok(PendingSession {
            socket,
            connected_at: Instant::now(),
            options: self.options,
            status: StatusCell::new(SessionStatus::Negotiating),
        })
    }
}

/// Connected transport waiting for its intent.
pub struct PendingSession {
    socket: Socket,
    connected_at: Instant,
    options: SessionOptions,
    status: StatusCell,
}

impl fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSession")
            .field("connected_at", &self.connected_at)
            .field("options", &self.options)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl PendingSession {
    /// `negotiating` until [`PendingSession::send_intent`] settles it.
    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// Receiver notified on every status change, carried over to the
    /// [`SubscriptionStream`] once accepted.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Time since the transport was established.
    pub fn elapsed(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Sends the intent, then waits out the acceptance window.
    pub async fn send_intent(
        mut self,
        intent: Intent,
    ) -> Result<SubscriptionStream, NegotiationError> {
        match self.negotiate(&intent).await {
            Ok(accepted) => {
                debug!(event = "session_accepted", early_events = accepted.early.len());
                Ok(SubscriptionStream::start(
                    self.socket,
                    intent,
                    accepted,
                    self.options,
                    self.status,
                ))
            }
            Err(err) => {
                self.status.transition(SessionStatus::Failed);
                Err(err)
            }
        }
    }

    async fn negotiate(&mut self, intent: &Intent) -> Result<Acceptance, NegotiationError> {
        validate_intent(intent)?;

        let grace = self.options.grace_window;
        let remaining = grace
            .checked_sub(self.connected_at.elapsed())
            .filter(|remaining| !remaining.is_zero());
        let Some(remaining) = remaining else {
            warn!(event = "grace_window_exceeded", grace_ms = grace.as_millis() as u64);
            let _ = self.socket.close(None).await;
            return Err(NegotiationError::GraceWindowExceeded(grace));
        };

        match tokio::time::timeout(remaining, self.socket.send(intent.to_message())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(NegotiationError::Transport(err)),
            Err(_) => return Err(NegotiationError::GraceWindowExceeded(grace)),
        }

        debug!(event = "intent_sent", mode = ?intent.mode());

        await_acceptance(&mut self.socket, self.options.acceptance_window).await
    }
}

/// Errors produced while bringing a session to `active`.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The resume token collides with a control payload or is empty.
    #[error("checkpoint {0:?} cannot be sent as a resume intent")]
    InvalidCheckpoint(String),

    #[error("websocket error: {0}")]
    Transport(#[from] WsError),

    #[error("transport did not connect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("intent was not sent within the {0:?} grace window")]
    GraceWindowExceeded(Duration),

    #[error("server rejected the subscription intent: {reason}")]
    Rejected { reason: String },
}

impl NegotiationError {
    /// Whether the failure happened before the server saw any intent.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectTimeout(_))
    }
}

fn validate_intent(intent: &Intent) -> Result<(), NegotiationError> {
    match intent.checkpoint() {
        Some(checkpoint) if !checkpoint.is_wire_safe() => Err(NegotiationError::InvalidCheckpoint(
            checkpoint.as_str().to_string(),
        )),
        _ => Ok(()),
    }
}

/// What the acceptance window saw.
#[derive(Debug, Default)]
pub(crate) struct Acceptance {
    /// Data frames in arrival order.
    pub(crate) early: Vec<(PayloadKind, Bytes)>,
    /// Set when the connection ended after the server had started streaming.
    pub(crate) interrupted: Option<StreamInterrupted>,
}

/// Watches the connection for `window` after the intent went out.
///
/// The server has no acknowledgement frame. It rejects by closing the
/// connection, at most after one text frame with the reason. A close that
/// follows anything more is an accepted session that was interrupted.
async fn await_acceptance(
    socket: &mut Socket,
    window: Duration,
) -> Result<Acceptance, NegotiationError> {
    let mut accepted = Acceptance::default();

    if window.is_zero() {
        return Ok(accepted);
    }

    let deadline = Instant::now() + window;

    loop {
        let Ok(next) = tokio::time::timeout_at(deadline, socket.next()).await else {
            return Ok(accepted);
        };

        let cause = match next {
            Some(Ok(message)) => match classify(message) {
                Frame::Data(kind, payload) => {
                    accepted.early.push((kind, payload));
                    continue;
                }
                Frame::Ping(payload) => {
                    socket.send(Message::Pong(payload)).await?;
                    continue;
                }
                Frame::Ignored => continue,
                Frame::Closed(reason) => StreamInterrupted::Closed { reason },
            },
            Some(Err(err)) => StreamInterrupted::Transport(err.to_string()),
            None => StreamInterrupted::Closed { reason: None },
        };

        if let Some(reason) = rejection_reason(&accepted.early, &cause) {
            warn!(event = "intent_rejected", %reason);
            return Err(NegotiationError::Rejected { reason });
        }

        warn!(
            event = "closed_during_acceptance",
            early_events = accepted.early.len(),
            error = %cause
        );
        accepted.interrupted = Some(cause);
        return Ok(accepted);
    }
}

fn rejection_reason(early: &[(PayloadKind, Bytes)], cause: &StreamInterrupted) -> Option<String> {
    match early {
        [] => Some(match cause {
            StreamInterrupted::Closed {
                reason: Some(reason),
            } => reason.clone(),
            other => other.to_string(),
        }),
        [(PayloadKind::Text, payload)] => Some(String::from_utf8_lossy(payload).into_owned()),
        _ => None,
    }
}
