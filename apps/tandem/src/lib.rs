pub mod chat;
pub mod config;
pub mod listeners;
pub mod media;
pub mod meeting;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use chat::{ChatChannel, ChatError, ChatMessage};
pub use config::{IceServer, SessionConfig};
pub use listeners::Subscription;
pub use media::{MediaConstraints, MediaError, MediaSource, TrackKind, TrackState};
pub use session::{
    ConnectionPhase, CoordinatorDeps, JoinError, PeerEvent, SessionCoordinator, SessionError,
    SessionFault, SessionState,
};
pub use signaling::{ConnectionKey, SignalingChannel, SignalingError, SignalingMessage};
