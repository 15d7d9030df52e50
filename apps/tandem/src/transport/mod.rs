//! The media transport between two connections.
//!
//! A [`PeerTransport`] is one direct link to one remote connection. It reports
//! candidates, link state and remote tracks through the event sender handed to
//! [`TransportFactory::create`].

pub mod loopback;
pub mod stun;
pub mod webrtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::ConnectionKey;

pub use loopback::LoopbackNetwork;
pub use self::webrtc::WebRtcTransportFactory;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("remote description rejected: {0}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
}

pub(crate) fn to_setup_error<E: Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Link(LinkState),
    RemoteTrack(TrackKind),
    RemoteTrackEnded(TrackKind),
}

/// Everything a factory needs to build a transport for one remote connection.
pub struct TransportContext {
    pub local_key: ConnectionKey,
    pub remote_key: ConnectionKey,
    pub ice_servers: Vec<IceServer>,
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer and install it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Fails when no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Point the outbound video sender at `track` without renegotiating.
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        context: TransportContext,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_wire_names_match_browser_init() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);

        let bare: IceCandidate = serde_json::from_str(r#"{"candidate":"candidate:x"}"#).unwrap();
        assert_eq!(bare.sdp_mid, None);
        assert_eq!(bare.sdp_mline_index, None);
    }
}
