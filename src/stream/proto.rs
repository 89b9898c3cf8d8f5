use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

/// Intent payload requesting a fresh subscription.
pub const CONNECT: &str = "connect";
/// Payload announcing a graceful suspend.
pub const DISCONNECT: &str = "disconnect";

/// Opaque resume token handed out by the server on graceful suspend.
///
/// The client never parses or orders checkpoints. A checkpoint is meant to
/// seed exactly one subsequent [`Intent::Resume`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(String);

impl Checkpoint {
    /// Wraps a token obtained from a suspend or persisted by the caller.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token exactly as the server sent it.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Token as an owned string, for persisting.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Whether the token can be told apart from the control payloads on the
    /// wire.
    pub(crate) fn is_wire_safe(&self) -> bool {
        !self.0.is_empty() && self.0 != CONNECT && self.0 != DISCONNECT
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Checkpoint {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for Checkpoint {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Whether a session started from scratch or from a checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionMode {
    Fresh,
    Resume,
}

/// First message of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    /// `"connect"`: only events produced from now on, plus whatever the
    /// service replays.
    Fresh,
    /// Events after the checkpoint.
    Resume(Checkpoint),
}

impl Intent {
    /// Fresh or resume.
    pub fn mode(&self) -> SubscriptionMode {
        match self {
            Self::Fresh => SubscriptionMode::Fresh,
            Self::Resume(_) => SubscriptionMode::Resume,
        }
    }

    /// Checkpoint a resume intent carries.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            Self::Fresh => None,
            Self::Resume(checkpoint) => Some(checkpoint),
        }
    }

    pub(crate) fn to_message(&self) -> Message {
        match self {
            Self::Fresh => Message::Text(CONNECT.to_string()),
            Self::Resume(checkpoint) => Message::Text(checkpoint.as_str().to_string()),
        }
    }
}

impl From<Option<Checkpoint>> for Intent {
    fn from(checkpoint: Option<Checkpoint>) -> Self {
        checkpoint.map_or(Self::Fresh, Self::Resume)
    }
}

/// Websocket frame type an event arrived in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// One undecoded unit of data delivered by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    sequence: u64,
    kind: PayloadKind,
    payload: Bytes,
}

impl Event {
    pub(crate) fn new(sequence: u64, kind: PayloadKind, payload: Bytes) -> Self {
        Self {
            sequence,
            kind,
            payload,
        }
    }

    /// Zero-based arrival position within the session.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Frame type the event arrived in.
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Raw payload bytes, consuming the event.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload as UTF-8, regardless of the frame kind.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Inbound websocket message reduced to what the session cares about.
#[derive(Debug)]
pub(crate) enum Frame {
    Data(PayloadKind, Bytes),
    Ping(Vec<u8>),
    Ignored,
    Closed(Option<String>),
}

pub(crate) fn classify(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Data(PayloadKind::Text, Bytes::from(text)),
        Message::Binary(bytes) => Frame::Data(PayloadKind::Binary, Bytes::from(bytes)),
        Message::Ping(payload) => Frame::Ping(payload),
        Message::Pong(_) | Message::Frame(_) => Frame::Ignored,
        Message::Close(frame) => Frame::Closed(
            frame
                .map(|frame| frame.reason.into_owned())
                .filter(|reason| !reason.is_empty()),
        ),
    }
}
