//! Meeting-scoped signaling over a relay.
//!
//! A [`SignalingChannel`] owns one relay link for one meeting. It stamps every
//! outgoing message with the meeting id and the local connection key, and
//! drops incoming envelopes for other meetings before any handler sees them.

pub mod relay;
pub mod websocket;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::listeners::{Listeners, Subscription};
use crate::media::TrackState;
use crate::transport::IceCandidate;

pub use relay::{LocalRelay, RelayLink, SignalingRelay};
pub use websocket::WebSocketRelay;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("relay did not answer within {0:?}")]
    Timeout(Duration),
    #[error("signaling channel closed")]
    Closed,
    #[error("malformed signaling payload: {0}")]
    Malformed(String),
    #[error("signaling transport error: {0}")]
    Transport(String),
}

/// Ephemeral identifier of one participant connection; fresh on every join.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ConnectionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum SignalingMessage {
    Join {
        connection_key: ConnectionKey,
        participant_id: String,
    },
    Leave {
        connection_key: ConnectionKey,
        participant_id: String,
    },
    /// `participantId` names the offering participant so the callee can tell
    /// a rejoin from a stranger.
    Offer {
        to_key: ConnectionKey,
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_id: Option<String>,
    },
    Answer {
        to_key: ConnectionKey,
        sdp: String,
    },
    Candidate {
        to_key: ConnectionKey,
        candidate: IceCandidate,
    },
    Chat {
        text: String,
        sender_id: String,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    Media {
        track_state: TrackState,
    },
}

impl SignalingMessage {
    pub fn label(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Leave { .. } => "leave",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Chat { .. } => "chat",
            SignalingMessage::Media { .. } => "media",
        }
    }

    /// The connection a directed message is meant for; `None` for broadcasts.
    pub fn recipient(&self) -> Option<&ConnectionKey> {
        match self {
            SignalingMessage::Offer { to_key, .. }
            | SignalingMessage::Answer { to_key, .. }
            | SignalingMessage::Candidate { to_key, .. } => Some(to_key),
            _ => None,
        }
    }
}

/// One message on the wire: `{"meetingId", "from", "type", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    pub meeting_id: String,
    pub from: ConnectionKey,
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl SignalingEnvelope {
    pub fn encode(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|err| SignalingError::Malformed(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|err| SignalingError::Malformed(err.to_string()))
    }
}

/// Handle to the relay for a single meeting. Clones share the same link.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    meeting_id: String,
    local_key: ConnectionKey,
    outbound: Mutex<Option<mpsc::UnboundedSender<SignalingEnvelope>>>,
    handlers: Listeners<SignalingEnvelope>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Open a link to `relay` for `meeting_id`, bounded by `timeout`.
    pub async fn connect(
        relay: &dyn SignalingRelay,
        meeting_id: &str,
        local_key: ConnectionKey,
        timeout: Duration,
    ) -> Result<Self, SignalingError> {
        let link = tokio::time::timeout(timeout, relay.open(meeting_id, &local_key))
            .await
            .map_err(|_| SignalingError::Timeout(timeout))??;
        let RelayLink {
            outbound,
            mut inbound,
        } = link;

        let inner = Arc::new(ChannelInner {
            meeting_id: meeting_id.to_owned(),
            local_key,
            outbound: Mutex::new(Some(outbound)),
            handlers: Listeners::new(),
            reader: Mutex::new(None),
        });

        let reader_inner = Arc::downgrade(&inner);
        let reader = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                let Some(inner) = reader_inner.upgrade() else {
                    break;
                };
                inner.dispatch(envelope);
            }
            tracing::debug!("relay link closed");
        });
        *inner.reader.lock() = Some(reader);

        tracing::debug!(
            meeting = %inner.meeting_id,
            key = %inner.local_key,
            "signaling channel connected"
        );
        Ok(Self { inner })
    }

    pub fn meeting_id(&self) -> &str {
        &self.inner.meeting_id
    }

    pub fn local_key(&self) -> &ConnectionKey {
        &self.inner.local_key
    }

    pub fn announce_join(&self, participant_id: &str) -> Result<(), SignalingError> {
        self.send(SignalingMessage::Join {
            connection_key: self.inner.local_key.clone(),
            participant_id: participant_id.to_owned(),
        })
    }

    pub fn announce_leave(&self, participant_id: &str) -> Result<(), SignalingError> {
        self.send(SignalingMessage::Leave {
            connection_key: self.inner.local_key.clone(),
            participant_id: participant_id.to_owned(),
        })
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let guard = self.inner.outbound.lock();
        let outbound = guard.as_ref().ok_or(SignalingError::Closed)?;
        tracing::trace!(
            meeting = %self.inner.meeting_id,
            kind = message.label(),
            "signaling out"
        );
        outbound
            .send(SignalingEnvelope {
                meeting_id: self.inner.meeting_id.clone(),
                from: self.inner.local_key.clone(),
                message,
            })
            .map_err(|_| SignalingError::Closed)
    }

    /// Register `handler` for every envelope of this meeting. Envelopes from
    /// one sender reach the handler in the order that sender sent them.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SignalingEnvelope) + Send + Sync + 'static,
    {
        self.inner.handlers.add(handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }

    /// Close the link and drop every handler. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let outbound = self.inner.outbound.lock().take();
        self.inner.handlers.clear();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        if outbound.is_some() {
            tracing::debug!(
                meeting = %self.inner.meeting_id,
                key = %self.inner.local_key,
                "signaling channel disconnected"
            );
        }
    }
}

impl ChannelInner {
    fn dispatch(&self, envelope: SignalingEnvelope) {
        if envelope.meeting_id != self.meeting_id {
            tracing::debug!(
                meeting = %self.meeting_id,
                foreign = %envelope.meeting_id,
                kind = envelope.message.label(),
                "dropping envelope for another meeting"
            );
            return;
        }
        if envelope.from == self.local_key {
            return;
        }
        tracing::trace!(
            meeting = %self.meeting_id,
            from = %envelope.from,
            kind = envelope.message.label(),
            "signaling in"
        );
        self.handlers.emit(&envelope);
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
