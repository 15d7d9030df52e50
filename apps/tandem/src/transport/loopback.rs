//! Deterministic in-process transport.
//!
//! Endpoints find each other through the endpoint id embedded in their
//! descriptions. A pair links once both sides hold a local and a remote
//! description and have each applied at least one candidate from the other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{
    IceCandidate, LinkState, PeerTransport, SdpKind, SessionDescription, TransportContext,
    TransportError, TransportEvent, TransportFactory,
};
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::ConnectionKey;

const SDP_MARKER: &str = "tandem-loopback";

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<u64, Endpoint>>,
    next_id: AtomicU64,
    offers: AtomicUsize,
    video_replacements: AtomicUsize,
}

struct Endpoint {
    local_key: ConnectionKey,
    events: mpsc::UnboundedSender<TransportEvent>,
    local: Option<SdpKind>,
    remote: Option<u64>,
    remote_candidates: usize,
    link: Option<u64>,
    interrupted: bool,
    closed: bool,
    audio: bool,
    video: Option<TrackKind>,
}

impl Endpoint {
    fn emit(&self, event: TransportEvent) {
        if !self.closed {
            let _ = self.events.send(event);
        }
    }

    fn outbound_kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        kinds.extend(self.video);
        kinds
    }

    fn ready_for(&self, peer: u64) -> bool {
        !self.closed
            && self.link.is_none()
            && self.local.is_some()
            && self.remote == Some(peer)
            && self.remote_candidates > 0
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers created across every endpoint so far.
    pub fn offers_created(&self) -> usize {
        self.inner.offers.load(Ordering::SeqCst)
    }

    pub fn video_replacements(&self) -> usize {
        self.inner.video_replacements.load(Ordering::SeqCst)
    }

    /// Linked pairs whose endpoints are both still open.
    pub fn active_links(&self) -> usize {
        let endpoints = self.inner.endpoints.lock();
        let linked = endpoints
            .values()
            .filter(|endpoint| {
                !endpoint.closed
                    && endpoint
                        .link
                        .and_then(|peer| endpoints.get(&peer))
                        .is_some_and(|peer| !peer.closed)
            })
            .count();
        linked / 2
    }

    pub fn open_endpoints(&self) -> usize {
        self.inner
            .endpoints
            .lock()
            .values()
            .filter(|endpoint| !endpoint.closed)
            .count()
    }

    /// Drop every link owned by `key` as a network outage would: both ends
    /// see `Disconnected`.
    pub fn interrupt(&self, key: &ConnectionKey) {
        self.set_interrupted(key, true);
    }

    /// Undo [`LoopbackNetwork::interrupt`]; both ends see `Connected` again.
    pub fn restore(&self, key: &ConnectionKey) {
        self.set_interrupted(key, false);
    }

    fn set_interrupted(&self, key: &ConnectionKey, interrupted: bool) {
        let state = if interrupted {
            LinkState::Disconnected
        } else {
            LinkState::Connected
        };
        let mut endpoints = self.inner.endpoints.lock();
        let pairs: Vec<(u64, u64)> = endpoints
            .iter()
            .filter(|(_, endpoint)| {
                endpoint.local_key == *key && !endpoint.closed && endpoint.interrupted != interrupted
            })
            .filter_map(|(id, endpoint)| endpoint.link.map(|peer| (*id, peer)))
            .collect();
        for (id, peer) in pairs {
            for side in [id, peer] {
                if let Some(endpoint) = endpoints.get_mut(&side) {
                    endpoint.interrupted = interrupted;
                    endpoint.emit(TransportEvent::Link(state));
                }
            }
        }
    }
}

impl NetworkInner {
    fn try_link(&self, endpoints: &mut HashMap<u64, Endpoint>, id: u64) {
        let Some(peer) = endpoints.get(&id).and_then(|endpoint| endpoint.remote) else {
            return;
        };
        let ready = endpoints.get(&id).is_some_and(|e| e.ready_for(peer))
            && endpoints.get(&peer).is_some_and(|e| e.ready_for(id));
        if !ready {
            return;
        }
        for (side, other) in [(id, peer), (peer, id)] {
            let kinds = endpoints
                .get(&other)
                .map(Endpoint::outbound_kinds)
                .unwrap_or_default();
            if let Some(endpoint) = endpoints.get_mut(&side) {
                endpoint.link = Some(other);
                endpoint.emit(TransportEvent::Link(LinkState::Connected));
                for kind in kinds {
                    endpoint.emit(TransportEvent::RemoteTrack(kind));
                }
            }
        }
        tracing::trace!(a = id, b = peer, "loopback endpoints linked");
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        context: TransportContext,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let endpoint = Endpoint {
            local_key: context.local_key,
            events: context.events,
            local: None,
            remote: None,
            remote_candidates: 0,
            link: None,
            interrupted: false,
            closed: false,
            audio: context.audio.is_some(),
            video: context.video.as_ref().map(LocalTrack::kind),
        };
        self.inner.endpoints.lock().insert(id, endpoint);
        Ok(Arc::new(LoopbackTransport {
            id,
            network: Arc::clone(&self.inner),
        }))
    }
}

struct LoopbackTransport {
    id: u64,
    network: Arc<NetworkInner>,
}

fn render_sdp(kind: SdpKind, id: u64) -> String {
    let kind = match kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    format!("v=0 {SDP_MARKER} {kind} endpoint={id}")
}

fn parse_sdp(description: &SessionDescription) -> Result<u64, TransportError> {
    let mut parts = description.sdp.split_whitespace();
    let (Some("v=0"), Some(SDP_MARKER), Some(kind), Some(endpoint)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TransportError::Rejected("unrecognised description".into()));
    };
    let expected = match description.kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    if kind != expected {
        return Err(TransportError::Rejected(format!(
            "expected {expected}, got {kind}"
        )));
    }
    endpoint
        .strip_prefix("endpoint=")
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TransportError::Rejected("missing endpoint id".into()))
}

impl LoopbackTransport {
    fn with_endpoint<T>(
        &self,
        f: impl FnOnce(&mut Endpoint) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut endpoints = self.network.endpoints.lock();
        let endpoint = endpoints
            .get_mut(&self.id)
            .filter(|endpoint| !endpoint.closed)
            .ok_or(TransportError::Closed)?;
        f(endpoint)
    }

    fn announce_candidate(&self, endpoint: &Endpoint) {
        endpoint.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let sdp = self.with_endpoint(|endpoint| {
            endpoint.local = Some(SdpKind::Offer);
            self.announce_candidate(endpoint);
            Ok(render_sdp(SdpKind::Offer, self.id))
        })?;
        self.network.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let sdp = {
            let mut endpoints = self.network.endpoints.lock();
            let endpoint = endpoints
                .get_mut(&self.id)
                .filter(|endpoint| !endpoint.closed)
                .ok_or(TransportError::Closed)?;
            if endpoint.remote.is_none() {
                return Err(TransportError::Setup("no remote offer applied".into()));
            }
            endpoint.local = Some(SdpKind::Answer);
            self.announce_candidate(endpoint);
            self.network.try_link(&mut endpoints, self.id);
            render_sdp(SdpKind::Answer, self.id)
        };
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let peer = parse_sdp(&description)?;
        let mut endpoints = self.network.endpoints.lock();
        let endpoint = endpoints
            .get_mut(&self.id)
            .filter(|endpoint| !endpoint.closed)
            .ok_or(TransportError::Closed)?;
        endpoint.remote = Some(peer);
        self.network.try_link(&mut endpoints, self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::Rejected(format!(
                "bad candidate {}",
                candidate.candidate
            )));
        }
        let mut endpoints = self.network.endpoints.lock();
        let endpoint = endpoints
            .get_mut(&self.id)
            .filter(|endpoint| !endpoint.closed)
            .ok_or(TransportError::Closed)?;
        if endpoint.remote.is_none() {
            return Err(TransportError::Setup(
                "remote description not set".into(),
            ));
        }
        endpoint.remote_candidates += 1;
        self.network.try_link(&mut endpoints, self.id);
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        let mut endpoints = self.network.endpoints.lock();
        let endpoint = endpoints
            .get_mut(&self.id)
            .filter(|endpoint| !endpoint.closed)
            .ok_or(TransportError::Closed)?;
        let previous = endpoint.video.replace(track.kind());
        let link = endpoint.link;
        self.network.video_replacements.fetch_add(1, Ordering::SeqCst);
        if previous == Some(track.kind()) {
            return Ok(());
        }
        if let Some(peer) = link.and_then(|peer| endpoints.get(&peer)) {
            if let Some(previous) = previous {
                peer.emit(TransportEvent::RemoteTrackEnded(previous));
            }
            peer.emit(TransportEvent::RemoteTrack(track.kind()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut endpoints = self.network.endpoints.lock();
        let Some(endpoint) = endpoints.get_mut(&self.id) else {
            return Ok(());
        };
        if endpoint.closed {
            return Ok(());
        }
        endpoint.closed = true;
        let link = endpoint.link;
        if let Some(peer) = link.and_then(|peer| endpoints.get(&peer)) {
            peer.emit(TransportEvent::Link(LinkState::Disconnected));
        }
        Ok(())
    }
}
