use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// A STUN/TURN server handed to the media transport as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

/// Timeouts and ICE configuration for a meeting session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on connecting to the relay during `join`.
    pub join_timeout: Duration,
    /// Bound on an offer/answer exchange reaching an established link.
    pub negotiation_timeout: Duration,
    /// How long a disconnected peer may take to recover before it is closed.
    pub disconnect_grace: Duration,
    pub ice_servers: Vec<IceServer>,
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything missing or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if env_flag("TANDEM_LOCALHOST_ONLY") {
            Vec::new()
        } else {
            env::var("TANDEM_ICE_SERVERS")
                .ok()
                .and_then(|raw| match serde_json::from_str::<Vec<IceServer>>(&raw) {
                    Ok(servers) => Some(servers),
                    Err(err) => {
                        tracing::warn!(error = %err, "ignoring malformed TANDEM_ICE_SERVERS");
                        None
                    }
                })
                .unwrap_or(defaults.ice_servers)
        };

        Self {
            join_timeout: env_millis("TANDEM_JOIN_TIMEOUT_MS").unwrap_or(defaults.join_timeout),
            negotiation_timeout: env_millis("TANDEM_NEGOTIATION_TIMEOUT_MS")
                .unwrap_or(defaults.negotiation_timeout),
            disconnect_grace: env_millis("TANDEM_DISCONNECT_GRACE_MS")
                .unwrap_or(defaults.disconnect_grace),
            ice_servers,
        }
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

pub(crate) fn env_flag(var: &str) -> bool {
    env::var(var)
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false)
}
