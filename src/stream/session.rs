//! Active subscription session.
//!
//! Once a session is accepted, a background worker owns the websocket. It
//! hands whole events to the consumer through a bounded channel, answers
//! pings, and runs the disconnect handshake when asked to suspend.
//! `SubscriptionStream` is the consumer-facing half.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

use crate::stream::negotiator::{Acceptance, CheckpointFrame, SessionOptions, Socket};
use crate::stream::proto::{
    classify, Checkpoint, Event, Frame, Intent, PayloadKind, SubscriptionMode, DISCONNECT,
};

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    Negotiating,
    Active,
    Suspending,
    Closed,
    Failed,
}

impl SessionStatus {
    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Suspending => "suspending",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// `closed` or `failed`; a new session is needed to continue.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Negotiating, Self::Active)
                | (Self::Negotiating, Self::Failed)
                | (Self::Active, Self::Suspending)
                | (Self::Active, Self::Failed)
                | (Self::Suspending, Self::Closed)
                | (Self::Suspending, Self::Failed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status shared from transport connect onward, by the consumer half and
/// the worker.
#[derive(Clone, Debug)]
pub(crate) struct StatusCell(Arc<watch::Sender<SessionStatus>>);

impl StatusCell {
    pub(crate) fn new(initial: SessionStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self(Arc::new(tx))
    }

    pub(crate) fn get(&self) -> SessionStatus {
        *self.0.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.0.subscribe()
    }

    /// Applies `next` if the lifecycle allows it. Returns whether it did.
    pub(crate) fn transition(&self, next: SessionStatus) -> bool {
        self.0.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }
            debug!(event = "session_status", from = %current, to = %next);
            *current = next;
            true
        })
    }
}

/// Connection lost while events were being consumed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamInterrupted {
    #[error("connection closed by server ({})", .reason.as_deref().unwrap_or("no reason given"))]
    Closed { reason: Option<String> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream worker stopped")]
    WorkerStopped,
}

/// Operation attempted in a state that does not allow it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {operation} while the session is {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    #[error("event sequence already ended; negotiate a new session")]
    ConsumptionEnded,
}

#[derive(Debug, Error)]
pub enum SuspendError {
    /// The connection went away before a checkpoint arrived. Events received
    /// but never consumed are handed back.
    #[error("suspend was not graceful: {reason}")]
    Ungraceful {
        reason: String,
        undelivered: Vec<Event>,
    },

    #[error(transparent)]
    InvalidState(#[from] SessionError),
}

impl SuspendError {
    /// Events handed back by an ungraceful suspend.
    pub fn undelivered(&self) -> &[Event] {
        match self {
            Self::Ungraceful { undelivered, .. } => undelivered,
            Self::InvalidState(_) => &[],
        }
    }
}

/// Result of a graceful suspend.
#[derive(Clone, Debug)]
pub struct Suspension {
    pub checkpoint: Checkpoint,
    /// Events the server sent that were never yielded, in arrival order.
    pub undelivered: Vec<Event>,
}

impl Suspension {
    /// Intent that resumes right after this suspension.
    pub fn into_intent(self) -> Intent {
        Intent::Resume(self.checkpoint)
    }
}

type Inbound = Result<Event, StreamInterrupted>;

#[derive(Debug)]
struct SuspendRequest {
    reply: oneshot::Sender<SuspendReply>,
}

#[derive(Debug)]
struct SuspendReply {
    result: Result<Checkpoint, String>,
    undelivered: Vec<Event>,
}

/// An accepted subscription session.
///
/// Events are read through [`SubscriptionStream::events`] or
/// [`SubscriptionStream::events_until`]. Both borrow the stream mutably, so
/// [`SubscriptionStream::suspend`] cannot overlap with consumption.
#[derive(Debug)]
pub struct SubscriptionStream {
    intent: Intent,
    inbound: mpsc::Receiver<Inbound>,
    suspend_tx: Option<oneshot::Sender<SuspendRequest>>,
    status: StatusCell,
    consumption_ended: bool,
    _worker: JoinHandle<()>,
}

impl SubscriptionStream {
    pub(crate) fn start(
        socket: Socket,
        intent: Intent,
        accepted: Acceptance,
        options: SessionOptions,
        status: StatusCell,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(options.event_buffer.max(1));
        let (suspend_tx, suspend_rx) = oneshot::channel();
        status.transition(SessionStatus::Active);

        let mut worker = Worker {
            socket,
            inbound: inbound_tx,
            status: status.clone(),
            backlog: VecDeque::new(),
            next_sequence: 0,
            interrupted: None,
            checkpoint_frame: options.checkpoint_frame,
            suspend_timeout: options.suspend_timeout,
        };
        for (kind, payload) in accepted.early {
            worker.enqueue(kind, payload);
        }

        info!(event = "session_active", mode = ?intent.mode());

        if let Some(cause) = accepted.interrupted {
            worker.interrupt(cause);
        }

        Self {
            intent,
            inbound: inbound_rx,
            suspend_tx: Some(suspend_tx),
            status,
            consumption_ended: false,
            _worker: tokio::spawn(worker.run(suspend_rx)),
        }
    }

    /// Whether the session started fresh or from a checkpoint.
    pub fn mode(&self) -> SubscriptionMode {
        self.intent.mode()
    }

    /// Checkpoint this session resumed from, if any.
    pub fn resumed_from(&self) -> Option<&Checkpoint> {
        self.intent.checkpoint()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Starts the event sequence. Dropping the returned value cancels it.
    ///
    /// The sequence can only be started once per session. After a connection
    /// failure it still yields the events received before the failure, then
    /// the [`StreamInterrupted`] cause.
    pub fn events(&mut self) -> Result<Events<'_>, SessionError> {
        self.begin_events(None)
    }

    /// Like [`SubscriptionStream::events`], ending once `cancel` fires.
    ///
    /// The token is checked before every delivery, so an event is either
    /// yielded whole or left for [`Suspension::undelivered`].
    pub fn events_until(&mut self, cancel: CancellationToken) -> Result<Events<'_>, SessionError> {
        self.begin_events(Some(cancel))
    }

    fn begin_events(
        &mut self,
        cancel: Option<CancellationToken>,
    ) -> Result<Events<'_>, SessionError> {
        if self.consumption_ended {
            return Err(SessionError::ConsumptionEnded);
        }

        let status = self.status();
        if !matches!(status, SessionStatus::Active | SessionStatus::Failed) {
            return Err(SessionError::InvalidState {
                operation: "consume events",
                status,
            });
        }

        self.consumption_ended = true;

        Ok(Events {
            stream: self,
            cancelled: cancel.map(|token| Box::pin(token.cancelled_owned())),
            finished: false,
            was_cancelled: false,
        })
    }

    /// Sends `"disconnect"`, waits for the checkpoint and closes the
    /// connection.
    pub async fn suspend(&mut self) -> Result<Suspension, SuspendError> {
        let status = self.status();
        if !matches!(status, SessionStatus::Active | SessionStatus::Failed) {
            return Err(SessionError::InvalidState {
                operation: "suspend",
                status,
            }
            .into());
        }

        let Some(suspend_tx) = self.suspend_tx.take() else {
            return Err(SessionError::InvalidState {
                operation: "suspend",
                status,
            }
            .into());
        };

        self.consumption_ended = true;
        self.status.transition(SessionStatus::Suspending);

        let (reply_tx, reply_rx) = oneshot::channel();
        let reply = match suspend_tx.send(SuspendRequest { reply: reply_tx }) {
            Ok(()) => reply_rx.await.ok(),
            Err(_) => None,
        };

        let mut undelivered = self.drain_inbound();

        let Some(reply) = reply else {
            self.status.transition(SessionStatus::Failed);
            return Err(SuspendError::Ungraceful {
                reason: "stream worker stopped before the checkpoint arrived".to_string(),
                undelivered,
            });
        };

        undelivered.extend(reply.undelivered);

        match reply.result {
            Ok(checkpoint) => {
                info!(
                    event = "session_suspended",
                    checkpoint = %checkpoint,
                    undelivered = undelivered.len()
                );
                Ok(Suspension {
                    checkpoint,
                    undelivered,
                })
            }
            Err(reason) => Err(SuspendError::Ungraceful {
                reason,
                undelivered,
            }),
        }
    }

    fn drain_inbound(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(item) = self.inbound.try_recv() {
            if let Ok(event) = item {
                events.push(event);
            }
        }
        events
    }
}

/// Lazy, cancellable sequence of events from one session.
///
/// Yields `Err(StreamInterrupted)` at most once, as its last item.
pub struct Events<'a> {
    stream: &'a mut SubscriptionStream,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    finished: bool,
    was_cancelled: bool,
}

impl Events<'_> {
    /// Whether the sequence ended because its token fired.
    pub fn was_cancelled(&self) -> bool {
        self.was_cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn interrupted(&mut self, cause: StreamInterrupted) -> Poll<Option<Inbound>> {
        self.finished = true;
        self.stream.status.transition(SessionStatus::Failed);
        Poll::Ready(Some(Err(cause)))
    }
}

impl fmt::Debug for Events<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("finished", &self.finished)
            .field("was_cancelled", &self.was_cancelled)
            .finish_non_exhaustive()
    }
}

impl Stream for Events<'_> {
    type Item = Result<Event, StreamInterrupted>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(cancelled) = this.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                debug!(event = "consumption_cancelled");
                this.finished = true;
                this.was_cancelled = true;
                return Poll::Ready(None);
            }
        }

        match this.stream.inbound.poll_recv(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(Some(Err(cause))) => this.interrupted(cause),
            Poll::Ready(None) => this.interrupted(StreamInterrupted::WorkerStopped),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum WorkerExit {
    Suspend(SuspendRequest),
    Dropped,
    Interrupted,
}

enum WorkerStep {
    Exit(WorkerExit),
    Read(Option<Result<Message, WsError>>),
    Delivered,
}

/// Owns the socket for the lifetime of an accepted session.
struct Worker {
    socket: Socket,
    inbound: mpsc::Sender<Inbound>,
    status: StatusCell,
    /// Events read from the socket but not yet in the channel.
    backlog: VecDeque<Event>,
    next_sequence: u64,
    interrupted: Option<StreamInterrupted>,
    checkpoint_frame: CheckpointFrame,
    suspend_timeout: Duration,
}

impl Worker {
    async fn run(mut self, mut suspend_rx: oneshot::Receiver<SuspendRequest>) {
        let exit = loop {
            let connected = self.interrupted.is_none();
            let has_pending = !self.backlog.is_empty() || !connected;
            let can_read = connected && self.backlog.is_empty();

            // The select output borrows `self.inbound`, so frames are handled after it.
            let step = tokio::select! {
                biased;
                request = &mut suspend_rx => match request {
                    Ok(request) => WorkerStep::Exit(WorkerExit::Suspend(request)),
                    Err(_) => WorkerStep::Exit(WorkerExit::Dropped),
                },
                permit = self.inbound.reserve(), if has_pending => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.backlog.pop_front() {
                            permit.send(Ok(event));
                            WorkerStep::Delivered
                        } else if let Some(cause) = self.interrupted.take() {
                            permit.send(Err(cause));
                            WorkerStep::Exit(WorkerExit::Interrupted)
                        } else {
                            WorkerStep::Delivered
                        }
                    }
                    Err(_) => WorkerStep::Exit(WorkerExit::Dropped),
                },
                frame = self.socket.next(), if can_read => WorkerStep::Read(frame),
            };

            match step {
                WorkerStep::Exit(exit) => break exit,
                WorkerStep::Read(frame) => self.on_frame(frame).await,
                WorkerStep::Delivered => {}
            }
        };

        match exit {
            WorkerExit::Suspend(request) => self.suspend(request).await,
            WorkerExit::Dropped => {
                debug!(event = "session_dropped");
                let _ = self.socket.close(None).await;
            }
            WorkerExit::Interrupted => {}
        }
    }

    fn enqueue(&mut self, kind: PayloadKind, payload: Bytes) {
        let event = Event::new(self.next_sequence, kind, payload);
        self.next_sequence += 1;
        self.backlog.push_back(event);
    }

    fn interrupt(&mut self, cause: StreamInterrupted) {
        warn!(event = "stream_interrupted", error = %cause);
        self.status.transition(SessionStatus::Failed);
        self.interrupted = Some(cause);
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(message)) => match classify(message) {
                Frame::Data(kind, payload) => self.enqueue(kind, payload),
                Frame::Ping(payload) => {
                    if let Err(err) = self.socket.send(Message::Pong(payload)).await {
                        self.interrupt(StreamInterrupted::Transport(err.to_string()));
                    }
                }
                Frame::Ignored => {}
                Frame::Closed(reason) => self.interrupt(StreamInterrupted::Closed { reason }),
            },
            Some(Err(err)) => self.interrupt(StreamInterrupted::Transport(err.to_string())),
            None => self.interrupt(StreamInterrupted::Closed { reason: None }),
        }
    }

    async fn suspend(mut self, request: SuspendRequest) {
        let timeout = self.suspend_timeout;
        let result = match self.interrupted.take() {
            Some(cause) => {
                let _ = tokio::time::timeout(timeout, self.socket.close(None)).await;
                Err(cause.to_string())
            }
            None => match tokio::time::timeout(timeout, self.disconnect_handshake()).await {
                Ok(result) => result,
                Err(_) => Err(format!("no checkpoint within {timeout:?}")),
            },
        };

        match &result {
            Ok(_) => self.status.transition(SessionStatus::Closed),
            Err(reason) => {
                warn!(event = "ungraceful_suspend", %reason);
                self.status.transition(SessionStatus::Failed)
            }
        };

        let undelivered = self.backlog.drain(..).collect();
        let _ = request.reply.send(SuspendReply {
            result,
            undelivered,
        });
    }

    /// Sends `"disconnect"`, reads the checkpoint and closes. Callers bound
    /// the whole exchange with `suspend_timeout`.
    async fn disconnect_handshake(&mut self) -> Result<Checkpoint, String> {
        debug!(event = "disconnect_sent");

        self.socket
            .send(Message::Text(DISCONNECT.to_string()))
            .await
            .map_err(|err| format!("failed to send disconnect: {err}"))?;

        let checkpoint = self.await_checkpoint().await;
        let _ = self.socket.close(None).await;
        checkpoint
    }

    async fn await_checkpoint(&mut self) -> Result<Checkpoint, String> {
        loop {
            let message = match self.socket.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(err.to_string()),
                None => return Err("connection ended before the checkpoint".to_string()),
            };

            match classify(message) {
                Frame::Data(PayloadKind::Binary, payload)
                    if self.checkpoint_frame == CheckpointFrame::TextOnly =>
                {
                    self.enqueue(PayloadKind::Binary, payload);
                }
                Frame::Data(_, payload) => {
                    return String::from_utf8(payload.to_vec())
                        .map(Checkpoint::new)
                        .map_err(|_| "checkpoint is not valid utf-8".to_string());
                }
                Frame::Ping(payload) => {
                    self.socket
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|err| err.to_string())?;
                }
                Frame::Ignored => {}
                Frame::Closed(reason) => {
                    return Err(reason
                        .unwrap_or_else(|| "connection closed before the checkpoint".to_string()));
                }
            }
        }
    }
}
