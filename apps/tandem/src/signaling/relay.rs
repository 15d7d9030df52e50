use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ConnectionKey, SignalingEnvelope, SignalingError};

/// Both directions of an open relay connection.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<SignalingEnvelope>,
    pub inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
}

/// A relay fans envelopes out to the other connections of the same meeting.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn open(
        &self,
        meeting_id: &str,
        local_key: &ConnectionKey,
    ) -> Result<RelayLink, SignalingError>;
}

/// In-process relay shared by every channel created from a clone of it.
#[derive(Clone, Default)]
pub struct LocalRelay {
    inner: Arc<LocalRelayInner>,
}

#[derive(Default)]
struct LocalRelayInner {
    meetings: RwLock<HashMap<String, HashMap<ConnectionKey, mpsc::UnboundedSender<SignalingEnvelope>>>>,
    unreachable: AtomicBool,
    duplicate: AtomicBool,
    open_delay: RwLock<Option<Duration>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Delay every `open` by `delay`.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.inner.open_delay.write() = delay;
    }

    /// Deliver every envelope twice, as an at-least-once relay may.
    pub fn set_duplicate_delivery(&self, duplicate: bool) {
        self.inner.duplicate.store(duplicate, Ordering::SeqCst);
    }

    /// Push a raw envelope straight into one member's inbound queue, behind
    /// anything already queued for it.
    pub fn inject(&self, to: &ConnectionKey, envelope: SignalingEnvelope) -> bool {
        let meetings = self.inner.meetings.read();
        meetings
            .values()
            .find_map(|members| members.get(to))
            .map(|sender| sender.send(envelope).is_ok())
            .unwrap_or(false)
    }

    pub fn member_count(&self, meeting_id: &str) -> usize {
        self.inner
            .meetings
            .read()
            .get(meeting_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }
}

impl LocalRelayInner {
    fn fan_out(&self, meeting_id: &str, envelope: &SignalingEnvelope) {
        let copies = if self.duplicate.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let meetings = self.meetings.read();
        let Some(members) = meetings.get(meeting_id) else {
            return;
        };
        for (key, sender) in members {
            if *key == envelope.from {
                continue;
            }
            for _ in 0..copies {
                let _ = sender.send(envelope.clone());
            }
        }
    }

    fn remove(&self, meeting_id: &str, key: &ConnectionKey) {
        let mut meetings = self.meetings.write();
        if let Some(members) = meetings.get_mut(meeting_id) {
            members.remove(key);
            if members.is_empty() {
                meetings.remove(meeting_id);
            }
        }
    }
}

#[async_trait]
impl SignalingRelay for LocalRelay {
    async fn open(
        &self,
        meeting_id: &str,
        local_key: &ConnectionKey,
    ) -> Result<RelayLink, SignalingError> {
        let delay = *self.inner.open_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(SignalingError::Unreachable("local relay offline".into()));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.inner
            .meetings
            .write()
            .entry(meeting_id.to_owned())
            .or_default()
            .insert(local_key.clone(), inbound_tx);

        let inner = Arc::clone(&self.inner);
        let meeting = meeting_id.to_owned();
        let key = local_key.clone();
        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                inner.fan_out(&meeting, &envelope);
            }
            inner.remove(&meeting, &key);
            tracing::trace!(meeting = %meeting, key = %key, "local relay member left");
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
