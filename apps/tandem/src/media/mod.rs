//! Local capture: the camera/microphone stream and the optional screen track.
//!
//! Track objects are created once and shared with every transport. Muting
//! flips a flag on the shared track instead of swapping it, so nothing has to
//! be renegotiated.

pub mod devices;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub use devices::{MediaDevices, SyntheticDevices};

/// Prefix of the stream id carried by screen-share tracks.
pub const SCREEN_STREAM_PREFIX: &str = "screen-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::Screen => "screen",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionFailure {
    PermissionDenied,
    DeviceUnavailable,
    Unknown,
}

impl fmt::Display for AcquisitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionFailure::PermissionDenied => "permission denied",
            AcquisitionFailure::DeviceUnavailable => "device unavailable",
            AcquisitionFailure::Unknown => "unknown failure",
        })
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media acquisition failed: {reason}")]
    Acquisition { reason: AcquisitionFailure },
    #[error("screen share denied")]
    ScreenShareDenied,
    #[error("media source already released")]
    Released,
    #[error("no local {0} track")]
    MissingTrack(TrackKind),
    #[error("failed to write sample: {0}")]
    Write(String),
}

/// Mute/camera/screen flags of one side of the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// A local outbound track. Clones refer to the same underlying track.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

struct TrackInner {
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video | TrackKind::Screen => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let id = format!("{kind}-{}", uuid::Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec,
            id,
            stream_id.to_owned(),
        ));
        Self {
            inner: Arc::new(TrackInner {
                kind,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.rtp.id()
    }

    pub fn stream_id(&self) -> &str {
        self.inner.rtp.stream_id()
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    /// Returns whether the flag changed.
    pub(crate) fn set_enabled(&self, enabled: bool) -> bool {
        self.inner.enabled.swap(enabled, Ordering::SeqCst) != enabled
    }

    /// Returns whether the track was still live.
    pub(crate) fn stop(&self) -> bool {
        self.inner.live.swap(false, Ordering::SeqCst)
    }

    /// Write one encoded frame. Disabled or stopped tracks drop it and report
    /// `Ok(false)`.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.inner
            .rtp
            .write_sample(sample)
            .await
            .map_err(|err| MediaError::Write(err.to_string()))?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Camera and microphone tracks acquired together.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl LocalStream {
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Screen => None,
        }
    }
}

/// One recorded enable/disable flip of a negotiated track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTransition {
    pub kind: TrackKind,
    pub enabled: bool,
    pub track_id: String,
}

/// Owner of the local capture for one meeting session.
pub struct MediaSource {
    devices: Arc<dyn MediaDevices>,
    stream: Option<LocalStream>,
    screen: Option<LocalTrack>,
    released: bool,
    transitions: Vec<TrackTransition>,
}

impl MediaSource {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: None,
            screen: None,
            released: false,
            transitions: Vec::new(),
        }
    }

    /// Open the camera and microphone. Devices are only asked once; later
    /// calls hand back the same stream.
    pub async fn acquire(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        if self.released {
            return Err(MediaError::Released);
        }
        if let Some(stream) = &self.stream {
            return Ok(stream.clone());
        }
        let stream = self.devices.open_user_media(&constraints).await?;
        tracing::debug!(
            stream = %stream.id,
            audio = stream.audio.is_some(),
            video = stream.video.is_some(),
            "local media acquired"
        );
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    pub fn screen_track(&self) -> Option<&LocalTrack> {
        self.screen.as_ref()
    }

    /// The track currently meant for the outbound video sender.
    pub fn outbound_video(&self) -> Option<LocalTrack> {
        self.screen
            .clone()
            .or_else(|| self.stream.as_ref().and_then(|s| s.video.clone()))
    }

    /// Flip `kind` on the already-negotiated track. Returns whether anything
    /// changed.
    pub fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) -> Result<bool, MediaError> {
        if self.released {
            return Err(MediaError::Released);
        }
        let track = self
            .stream
            .as_ref()
            .and_then(|stream| stream.track(kind))
            .ok_or(MediaError::MissingTrack(kind))?;
        if !track.set_enabled(enabled) {
            return Ok(false);
        }
        tracing::debug!(track = %track.id(), %kind, enabled, "local track toggled");
        self.transitions.push(TrackTransition {
            kind,
            enabled,
            track_id: track.id().to_owned(),
        });
        Ok(true)
    }

    pub async fn start_screen_share(&mut self) -> Result<LocalTrack, MediaError> {
        if self.released {
            return Err(MediaError::Released);
        }
        if let Some(track) = &self.screen {
            return Ok(track.clone());
        }
        let track = self.devices.open_display_media().await?;
        tracing::debug!(track = %track.id(), "screen share started");
        self.screen = Some(track.clone());
        Ok(track)
    }

    pub fn stop_screen_share(&mut self) -> Option<LocalTrack> {
        let track = self.screen.take()?;
        track.stop();
        tracing::debug!(track = %track.id(), "screen share stopped");
        Some(track)
    }

    /// Stop every track. Returns how many were still live.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let mut stopped = 0;
        if let Some(stream) = self.stream.take() {
            stopped += stream.tracks().filter(|track| track.stop()).count();
        }
        if let Some(screen) = self.screen.take() {
            stopped += usize::from(screen.stop());
        }
        tracing::debug!(stopped, "local media released");
        stopped
    }

    pub fn live_track_count(&self) -> usize {
        let camera = self
            .stream
            .as_ref()
            .map(|stream| stream.tracks().filter(|t| t.is_live()).count())
            .unwrap_or(0);
        camera + self.screen.iter().filter(|t| t.is_live()).count()
    }

    pub fn track_state(&self) -> TrackState {
        let enabled = |kind| {
            self.stream
                .as_ref()
                .and_then(|stream| stream.track(kind))
                .map(LocalTrack::is_enabled)
                .unwrap_or(false)
        };
        TrackState {
            audio_enabled: enabled(TrackKind::Audio),
            video_enabled: enabled(TrackKind::Video),
            screen_sharing: self.screen.is_some(),
        }
    }

    pub fn transitions(&self) -> &[TrackTransition] {
        &self.transitions
    }
}
