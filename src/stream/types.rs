use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 3_000;
pub const MIN_RETRY_BASE_DELAY_MS: u64 = 100;
pub const MAX_RETRY_BASE_DELAY_MS: u64 = 60_000;
pub const DEFAULT_TLS_POLICY: TlsPolicy = TlsPolicy::Verified;
pub const DEFAULT_EMIT_ON_PING: bool = true;
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;
pub const MAX_FRAME_SIZE: usize = 16 << 20;

pub const CLOSE_NORMAL: u16 = 1_000;
pub const CLOSE_NO_STATUS: u16 = 1_005;
pub const CLOSE_ABNORMAL: u16 = 1_006;

pub const ENV_FEED_ENDPOINT: &str = "FEED_ENDPOINT";
pub const ENV_TLS_POLICY: &str = "FEED_TLS_POLICY";
pub const ENV_RETRY_BASE_MS: &str = "FEED_RETRY_BASE_MS";
pub const ENV_RETRY_MAX_MS: &str = "FEED_RETRY_MAX_MS";
pub const ENV_CONNECT_MODE: &str = "FEED_CONNECT_MODE";
pub const ENV_EMIT_ON_PING: &str = "FEED_EMIT_ON_PING";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closing,
}

/// Socket-level readiness as reported by a transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    New,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Certificate validation applied to `wss://` feeds.
///
/// `AcceptInvalidCerts` trusts any server certificate. It exists for feeds
/// fronted by self-signed or mis-issued certificates and removes all
/// protection against interception; it is never the default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsPolicy {
    Verified,
    AcceptInvalidCerts,
}

impl FromStr for TlsPolicy {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "verified" => Ok(Self::Verified),
            "accept_invalid_certs" => Ok(Self::AcceptInvalidCerts),
            other => Err(AppError::InvalidArgument(format!(
                "tls policy must be verified or accept_invalid_certs, got {other}"
            ))),
        }
    }
}

/// How `Transport::connect` runs the opening handshake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// The handshake completes (or fails) before `connect` returns.
    Blocking,
    /// `connect` starts the handshake and returns; failures arrive as
    /// error and close events.
    Background,
}

impl ConnectMode {
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::Blocking
        } else {
            Self::Background
        }
    }
}

impl Default for ConnectMode {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl FromStr for ConnectMode {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(Self::Blocking),
            "background" => Ok(Self::Background),
            other => Err(AppError::InvalidArgument(format!(
                "connect mode must be blocking or background, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
}

impl FeedMessage {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(payload) | Self::Ping(payload) => payload.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// The socket had reached `Open`.
    Dropped,
    /// The handshake never completed; retrying may succeed.
    HandshakeFailed,
    /// The handshake never completed and retrying cannot fix it.
    HandshakeRejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
    pub kind: CloseKind,
}

impl CloseInfo {
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean: true,
            kind: CloseKind::Dropped,
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            was_clean: false,
            kind: CloseKind::Dropped,
        }
    }

    pub fn handshake_failed(error: &AppError) -> Self {
        let kind = if error.is_retryable() {
            CloseKind::HandshakeFailed
        } else {
            CloseKind::HandshakeRejected
        };
        Self {
            code: CLOSE_ABNORMAL,
            reason: error.to_string(),
            was_clean: false,
            kind,
        }
    }

    pub fn was_open(&self) -> bool {
        self.kind == CloseKind::Dropped
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LinkArgs {
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub tls_policy: Option<TlsPolicy>,
    pub connect_mode: Option<ConnectMode>,
    pub emit_on_ping: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single backoff wait. `None` keeps the linear
    /// `attempt * base` delay unbounded.
    pub retry_max_delay_ms: Option<u64>,
    pub tls_policy: TlsPolicy,
    pub connect_mode: ConnectMode,
    pub emit_on_ping: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: None,
            tls_policy: DEFAULT_TLS_POLICY,
            connect_mode: ConnectMode::platform_default(),
            emit_on_ping: DEFAULT_EMIT_ON_PING,
        }
    }
}

impl LinkArgs {
    pub fn normalize(self) -> Result<LinkConfig, AppError> {
        let retry_base_delay_ms = self
            .retry_base_delay_ms
            .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);
        if !(MIN_RETRY_BASE_DELAY_MS..=MAX_RETRY_BASE_DELAY_MS).contains(&retry_base_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "retryBaseDelayMs must be between {MIN_RETRY_BASE_DELAY_MS} and {MAX_RETRY_BASE_DELAY_MS}"
            )));
        }

        if let Some(max_delay_ms) = self.retry_max_delay_ms {
            if max_delay_ms < retry_base_delay_ms {
                return Err(AppError::InvalidArgument(
                    "retryMaxDelayMs must not be lower than retryBaseDelayMs".to_string(),
                ));
            }
        }

        Ok(LinkConfig {
            retry_base_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms,
            tls_policy: self.tls_policy.unwrap_or(DEFAULT_TLS_POLICY),
            connect_mode: self.connect_mode.unwrap_or_default(),
            emit_on_ping: self.emit_on_ping.unwrap_or(DEFAULT_EMIT_ON_PING),
        })
    }

    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let read_u64 = |key: &str| -> Result<Option<u64>, AppError> {
            read(key)
                .map(|value| {
                    value.parse::<u64>().map_err(|_| {
                        AppError::InvalidArgument(format!("{key} must be an integer, got {value}"))
                    })
                })
                .transpose()
        };

        let emit_on_ping = read(ENV_EMIT_ON_PING)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(AppError::InvalidArgument(format!(
                    "{ENV_EMIT_ON_PING} must be a boolean, got {value}"
                ))),
            })
            .transpose()?;

        Ok(Self {
            retry_base_delay_ms: read_u64(ENV_RETRY_BASE_MS)?,
            retry_max_delay_ms: read_u64(ENV_RETRY_MAX_MS)?,
            tls_policy: read(ENV_TLS_POLICY)
                .map(|value| value.parse::<TlsPolicy>())
                .transpose()?,
            connect_mode: read(ENV_CONNECT_MODE)
                .map(|value| value.parse::<ConnectMode>())
                .transpose()?,
            emit_on_ping,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatusSnapshot {
    pub state: ConnectionState,
    pub resumed: bool,
    pub retry_attempt: u32,
    pub endpoint: Option<String>,
    pub first_message_received: bool,
}
