//! Two-party meeting sessions.

pub mod coordinator;
pub mod negotiator;
pub mod registry;
mod state;

use std::time::Duration;
use thiserror::Error;

use crate::media::MediaError;
use crate::signaling::SignalingError;

pub use coordinator::{CoordinatorDeps, SessionCoordinator};
pub use negotiator::{
    CloseReason, NegotiationFailed, NegotiationFailure, NegotiationSession, NegotiationState, Role,
};
pub use registry::PeerRegistry;
pub use state::{ConnectionPhase, PeerEvent, PeerSnapshot, SessionFault, SessionState};

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("local media unavailable: {0}")]
    Media(#[source] MediaError),
    #[error("signaling unavailable: {0}")]
    Signaling(#[source] SignalingError),
    #[error("signaling did not connect within {0:?}")]
    Timeout(Duration),
    #[error("already joined a meeting")]
    AlreadyJoined,
    #[error("join cancelled by leave")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not joined to a meeting")]
    NotJoined,
    #[error("camera toggle unavailable while sharing the screen")]
    ScreenShareActive,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}
