use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};
use url::Url;

use super::relay::{RelayLink, SignalingRelay};
use super::{ConnectionKey, SignalingEnvelope, SignalingError};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Relay client speaking JSON envelopes over `<base>/ws/<meetingId>`.
#[derive(Debug, Clone)]
pub struct WebSocketRelay {
    base: Url,
}

impl WebSocketRelay {
    pub fn new(base_url: &str) -> Result<Self, SignalingError> {
        let base = Url::parse(base_url).map_err(|err| {
            SignalingError::Unreachable(format!("invalid relay url {base_url}: {err}"))
        })?;
        Ok(Self { base })
    }

    pub fn meeting_url(&self, meeting_id: &str) -> Result<Url, SignalingError> {
        derive_websocket_url(&self.base, meeting_id)
    }
}

fn derive_websocket_url(base: &Url, meeting_id: &str) -> Result<Url, SignalingError> {
    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(SignalingError::Unreachable(format!(
                "unsupported relay scheme {other}"
            )));
        }
    };
    ws.set_scheme(scheme)
        .map_err(|_| SignalingError::Unreachable("invalid websocket scheme".into()))?;
    ws.path_segments_mut()
        .map_err(|_| SignalingError::Unreachable("relay url cannot carry a path".into()))?
        .pop_if_empty()
        .push("ws")
        .push(meeting_id);
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

#[async_trait]
impl SignalingRelay for WebSocketRelay {
    async fn open(
        &self,
        meeting_id: &str,
        local_key: &ConnectionKey,
    ) -> Result<RelayLink, SignalingError> {
        let url = self.meeting_url(meeting_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Unreachable(format!("websocket connect failed: {err}")))?;
        tracing::debug!(url = %url, key = %local_key, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => {
                        let Some(envelope) = next else { break };
                        let text = match envelope.encode() {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(error = %err, "dropping unencodable envelope");
                                continue;
                            }
                        };
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if ws_write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("relay websocket closed: {err}");
                            }
                            _ => tracing::warn!("relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                match SignalingEnvelope::decode(&text) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, len = text.len(), "ignoring malformed relay frame");
                    }
                }
            }
        });

        Ok(RelayLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_meeting_path_from_base() {
        let relay = WebSocketRelay::new("https://relay.example.com/signal/").unwrap();
        assert_eq!(
            relay.meeting_url("m1").unwrap().as_str(),
            "wss://relay.example.com/signal/ws/m1"
        );

        let relay = WebSocketRelay::new("http://127.0.0.1:8080?x=1").unwrap();
        assert_eq!(
            relay.meeting_url("abc").unwrap().as_str(),
            "ws://127.0.0.1:8080/ws/abc"
        );
    }

    #[test]
    fn rejects_unsupported_scheme() {
        let relay = WebSocketRelay::new("ftp://relay.example.com").unwrap();
        assert!(matches!(
            relay.meeting_url("m1"),
            Err(SignalingError::Unreachable(_))
        ));
    }
}
