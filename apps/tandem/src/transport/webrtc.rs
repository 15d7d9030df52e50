use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{
    IceCandidate, LinkState, PeerTransport, SdpKind, SessionDescription, TransportContext,
    TransportError, TransportEvent, TransportFactory, to_setup_error,
};
use crate::config::IceServer;
use crate::media::{LocalTrack, SCREEN_STREAM_PREFIX, TrackKind};

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn remote_track_kind(codec: RTPCodecType, stream_id: &str) -> Option<TrackKind> {
    match codec {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video if stream_id.starts_with(SCREEN_STREAM_PREFIX) => {
            Some(TrackKind::Screen)
        }
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

/// Builds one `RTCPeerConnection` per remote connection.
#[derive(Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        context: TransportContext,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let api = build_api(SettingEngine::default())?;
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&context.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        if let Some(audio) = &context.audio {
            let track: Arc<dyn TrackLocal + Send + Sync> = audio.rtp_track();
            pc.add_track(track).await.map_err(to_setup_error)?;
        }
        let video_sender = match &context.video {
            Some(video) => {
                let track: Arc<dyn TrackLocal + Send + Sync> = video.rtp_track();
                Some(pc.add_track(track).await.map_err(to_setup_error)?)
            }
            None => None,
        };

        let remote = context.remote_key.clone();
        let events = context.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events.clone();
            let remote = remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(peer = %remote, error = %err, "failed to serialise local candidate");
                    }
                }
            })
        }));

        let remote = context.remote_key.clone();
        let events = context.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = events.clone();
            let remote = remote.clone();
            Box::pin(async move {
                tracing::debug!(peer = %remote, ?state, "peer connection state changed");
                if let Some(state) = link_state(state) {
                    let _ = events.send(TransportEvent::Link(state));
                }
            })
        }));

        let events = context.events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = events.clone();
            Box::pin(async move {
                let stream_id = track.stream_id().to_string();
                let Some(kind) = remote_track_kind(track.kind(), &stream_id) else {
                    return;
                };
                let _ = events.send(TransportEvent::RemoteTrack(kind));
                tokio::spawn(async move {
                    // Rendering happens elsewhere; drain until the track ends.
                    while track.read_rtp().await.is_ok() {}
                    let _ = events.send(TransportEvent::RemoteTrackEnded(kind));
                });
            })
        }));

        tracing::debug!(
            local = %context.local_key,
            peer = %context.remote_key,
            ice_servers = context.ice_servers.len(),
            "peer connection created"
        );
        Ok(Arc::new(WebRtcTransport {
            pc,
            video_sender: Mutex::new(video_sender),
        }))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

fn rejected<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Rejected(err.to_string())
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(to_setup_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(to_setup_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(rejected)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rejected)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(to_setup_error)
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Setup("no outbound video sender".into()))?;
        let replacement: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        sender
            .replace_track(Some(replacement))
            .await
            .map_err(to_setup_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.video_sender.lock().take();
        self.pc.close().await.map_err(to_setup_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_tracks_are_recognised_by_stream_id() {
        assert_eq!(
            remote_track_kind(RTPCodecType::Video, "screen-1234"),
            Some(TrackKind::Screen)
        );
        assert_eq!(
            remote_track_kind(RTPCodecType::Video, "camera-1234"),
            Some(TrackKind::Video)
        );
        assert_eq!(
            remote_track_kind(RTPCodecType::Audio, "camera-1234"),
            Some(TrackKind::Audio)
        );
        assert_eq!(remote_track_kind(RTPCodecType::Unspecified, "x"), None);
    }

    #[test]
    fn ice_servers_map_optional_credentials() {
        let servers = rtc_ice_servers(&[
            IceServer::stun("stun:stun.l.google.com:19302"),
            IceServer {
                urls: vec!["turn:turn.example.com".into()],
                username: Some("user".into()),
                credential: Some("secret".into()),
            },
        ]);
        assert_eq!(servers[0].username, "");
        assert_eq!(servers[1].credential, "secret");
    }
}
