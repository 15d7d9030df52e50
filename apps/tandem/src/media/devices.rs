use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    AcquisitionFailure, LocalStream, LocalTrack, MediaConstraints, MediaError,
    SCREEN_STREAM_PREFIX, TrackKind,
};

/// Capture backends: camera/microphone and display capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError>;

    async fn open_display_media(&self) -> Result<LocalTrack, MediaError>;
}

/// Devices that produce tracks without touching hardware. Failures and
/// latency can be scripted.
#[derive(Default)]
pub struct SyntheticDevices {
    deny_user: Option<AcquisitionFailure>,
    deny_display: bool,
    latency: Option<Duration>,
    user_opens: AtomicUsize,
    opened: Mutex<Vec<LocalTrack>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_user_media(mut self, reason: AcquisitionFailure) -> Self {
        self.deny_user = Some(reason);
        self
    }

    pub fn deny_display_media(mut self) -> Self {
        self.deny_display = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn user_media_opens(&self) -> usize {
        self.user_opens.load(Ordering::SeqCst)
    }

    /// Tracks handed out so far that have not been stopped.
    pub fn live_tracks(&self) -> usize {
        self.opened.lock().iter().filter(|t| t.is_live()).count()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        self.user_opens.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(reason) = self.deny_user {
            return Err(MediaError::Acquisition { reason });
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::Acquisition {
                reason: AcquisitionFailure::DeviceUnavailable,
            });
        }
        let stream_id = format!("camera-{}", uuid::Uuid::new_v4());
        let audio = constraints
            .audio
            .then(|| LocalTrack::new(TrackKind::Audio, &stream_id));
        let video = constraints
            .video
            .then(|| LocalTrack::new(TrackKind::Video, &stream_id));
        let mut opened = self.opened.lock();
        opened.extend(audio.iter().cloned());
        opened.extend(video.iter().cloned());
        Ok(LocalStream {
            id: stream_id,
            audio,
            video,
        })
    }

    async fn open_display_media(&self) -> Result<LocalTrack, MediaError> {
        self.simulate_latency().await;
        if self.deny_display {
            return Err(MediaError::ScreenShareDenied);
        }
        let stream_id = format!("{SCREEN_STREAM_PREFIX}{}", uuid::Uuid::new_v4());
        let track = LocalTrack::new(TrackKind::Screen, &stream_id);
        self.opened.lock().push(track.clone());
        Ok(track)
    }
}
