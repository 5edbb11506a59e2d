use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_FALLBACK_URL: &str = "ws://127.0.0.1:8765";
pub const DEFAULT_SERVICE_NAME: &str = "rlmachine-ws";
pub const DEFAULT_TIMEFRAME: &str = "M15";
pub const DEFAULT_SECURE_TRANSPORT: bool = false;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5_000;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 10_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 100;
pub const MAX_RECONNECT_DELAY_MS: u64 = 300_000;
pub const MIN_DISCOVERY_TIMEOUT_MS: u64 = 500;
pub const MAX_DISCOVERY_TIMEOUT_MS: u64 = 60_000;
pub const MIN_AUTH_TIMEOUT_MS: u64 = 1_000;
pub const MAX_AUTH_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Authenticating,
    Active,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    /// Forward steps of the session lifecycle, plus `Closed` from anywhere and
    /// `Closed -> Resolving` for the retry.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::Closed)
                | (Self::Idle, Self::Resolving)
                | (Self::Closed, Self::Resolving)
                | (Self::Resolving, Self::Connecting)
                | (Self::Connecting, Self::Authenticating)
                | (Self::Connecting, Self::Active)
                | (Self::Authenticating, Self::Active)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionError {
    InvalidCredential,
    Transport { reason: String },
    HandshakeTimeout,
}

impl ConnectionError {
    /// Persistent errors need operator action; the rest clear on the next
    /// active session.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::InvalidCredential)
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidCredential => "Invalid token".to_string(),
            Self::Transport { reason } => reason.clone(),
            Self::HandshakeTimeout => "authentication handshake timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    pub attempt: u32,
    pub error: Option<ConnectionError>,
}

impl ConnectionStatus {
    pub fn idle() -> Self {
        Self {
            state: ConnectionState::Idle,
            endpoint: None,
            attempt: 0,
            error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Active
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineArgs {
    pub fallback_url: Option<String>,
    pub credential: Option<String>,
    pub discovery_url: Option<String>,
    pub discovery_key: Option<String>,
    pub service_name: Option<String>,
    pub secure_transport: Option<bool>,
    pub reconnect_delay_ms: Option<u64>,
    pub discovery_timeout_ms: Option<u64>,
    pub auth_timeout_ms: Option<u64>,
    pub default_timeframe: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub base_url: String,
    pub api_key: String,
    pub service_name: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fallback_url: String,
    pub credential: Option<String>,
    pub discovery: Option<DiscoveryConfig>,
    pub secure_transport: bool,
    pub reconnect_delay: Duration,
    pub auth_timeout: Duration,
    pub default_timeframe: String,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn ensure_range(name: &str, value: u64, min: u64, max: u64) -> Result<u64, AppError> {
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

impl EngineArgs {
    pub fn normalize(self) -> Result<EngineConfig, AppError> {
        let fallback_url =
            non_blank(self.fallback_url).unwrap_or_else(|| DEFAULT_FALLBACK_URL.to_string());
        if !(fallback_url.starts_with("ws://") || fallback_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "fallbackUrl must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let reconnect_delay_ms = ensure_range(
            "reconnectDelayMs",
            self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            MIN_RECONNECT_DELAY_MS,
            MAX_RECONNECT_DELAY_MS,
        )?;
        let discovery_timeout_ms = ensure_range(
            "discoveryTimeoutMs",
            self.discovery_timeout_ms
                .unwrap_or(DEFAULT_DISCOVERY_TIMEOUT_MS),
            MIN_DISCOVERY_TIMEOUT_MS,
            MAX_DISCOVERY_TIMEOUT_MS,
        )?;
        let auth_timeout_ms = ensure_range(
            "authTimeoutMs",
            self.auth_timeout_ms.unwrap_or(DEFAULT_AUTH_TIMEOUT_MS),
            MIN_AUTH_TIMEOUT_MS,
            MAX_AUTH_TIMEOUT_MS,
        )?;

        let discovery = match non_blank(self.discovery_url) {
            Some(base_url) => {
                if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                    return Err(AppError::InvalidArgument(
                        "discoveryUrl must use the http:// or https:// scheme".to_string(),
                    ));
                }
                let service_name = non_blank(self.service_name)
                    .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
                if !service_name
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
                {
                    return Err(AppError::InvalidArgument(
                        "serviceName must be alphanumeric ASCII, '-' or '_'".to_string(),
                    ));
                }
                Some(DiscoveryConfig {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    api_key: non_blank(self.discovery_key).unwrap_or_default(),
                    service_name,
                    timeout: Duration::from_millis(discovery_timeout_ms),
                })
            }
            None => None,
        };

        let default_timeframe =
            non_blank(self.default_timeframe).unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string());

        Ok(EngineConfig {
            fallback_url,
            credential: non_blank(self.credential),
            discovery,
            secure_transport: self.secure_transport.unwrap_or(DEFAULT_SECURE_TRANSPORT),
            reconnect_delay: Duration::from_millis(reconnect_delay_ms),
            auth_timeout: Duration::from_millis(auth_timeout_ms),
            default_timeframe,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSession {
    pub running: bool,
    pub fallback_url: String,
    pub discovery_enabled: bool,
    pub secure_transport: bool,
    pub credential_configured: bool,
    pub reconnect_delay_ms: u64,
    pub auth_timeout_ms: u64,
    pub default_timeframe: String,
}

impl EngineSession {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            running: true,
            fallback_url: config.fallback_url.clone(),
            discovery_enabled: config.discovery.is_some(),
            secure_transport: config.secure_transport,
            credential_configured: config.credential.is_some(),
            reconnect_delay_ms: config.reconnect_delay.as_millis() as u64,
            auth_timeout_ms: config.auth_timeout.as_millis() as u64,
            default_timeframe: config.default_timeframe.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStopResult {
    pub stopped: bool,
}
