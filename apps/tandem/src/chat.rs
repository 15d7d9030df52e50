//! Text chat carried on the meeting's signaling link.

use thiserror::Error;
use time::OffsetDateTime;

use crate::listeners::Subscription;
use crate::signaling::{ConnectionKey, SignalingChannel, SignalingError, SignalingMessage};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat message is empty")]
    Empty,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub sender_id: String,
    pub from: ConnectionKey,
    pub timestamp: OffsetDateTime,
}

#[derive(Clone)]
pub struct ChatChannel {
    signaling: SignalingChannel,
    sender_id: String,
}

impl ChatChannel {
    pub fn new(signaling: SignalingChannel, sender_id: impl Into<String>) -> Self {
        Self {
            signaling,
            sender_id: sender_id.into(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Send `text` to the other participant and return the local copy.
    /// Surrounding whitespace is trimmed; nothing is sent for a blank message.
    pub fn send(&self, text: &str) -> Result<ChatMessage, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Empty);
        }
        let timestamp = OffsetDateTime::now_utc();
        self.signaling.send(SignalingMessage::Chat {
            text: text.to_owned(),
            sender_id: self.sender_id.clone(),
            timestamp,
        })?;
        Ok(ChatMessage {
            text: text.to_owned(),
            sender_id: self.sender_id.clone(),
            from: self.signaling.local_key().clone(),
            timestamp,
        })
    }

    /// Call `callback` for every chat message from another connection.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.signaling.subscribe(move |envelope| {
            if let SignalingMessage::Chat {
                text,
                sender_id,
                timestamp,
            } = &envelope.message
            {
                callback(&ChatMessage {
                    text: text.clone(),
                    sender_id: sender_id.clone(),
                    from: envelope.from.clone(),
                    timestamp: *timestamp,
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::LocalRelay;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn channel(relay: &LocalRelay, key: &str, sender: &str) -> ChatChannel {
        let signaling =
            SignalingChannel::connect(relay, "meeting-1", key.into(), Duration::from_secs(1))
                .await
                .unwrap();
        ChatChannel::new(signaling, sender)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn messages_reach_the_other_side_trimmed() {
        let relay = LocalRelay::new();
        let alice = channel(&relay, "k1", "alice").await;
        let bob = channel(&relay, "k2", "bob").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bob.on_message(move |message| {
            let _ = tx.send(message.clone());
        });

        let sent = alice.send("  hello bob \n").unwrap();
        assert_eq!(sent.text, "hello bob");
        let received = rx.recv().await.unwrap();
        assert_eq!(received.text, "hello bob");
        assert_eq!(received.sender_id, "alice");
        assert_eq!(received.from, ConnectionKey::from("k1"));
        assert_eq!(received.timestamp.unix_timestamp(), sent.timestamp.unix_timestamp());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn blank_messages_are_rejected() {
        let relay = LocalRelay::new();
        let alice = channel(&relay, "k1", "alice").await;
        assert!(matches!(alice.send("   \t"), Err(ChatError::Empty)));
        assert!(matches!(alice.send(""), Err(ChatError::Empty)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn send_after_disconnect_fails() {
        let relay = LocalRelay::new();
        let alice = channel(&relay, "k1", "alice").await;
        alice.signaling.disconnect();
        assert!(matches!(
            alice.send("hi"),
            Err(ChatError::Signaling(SignalingError::Closed))
        ));
    }
}
