//! Stream client configuration and endpoint derivation.

use crate::error::{ClientError, Result};
use std::time::Duration;
use url::Url;

/// Default interval between keep-alive ping frames.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Default delay between reconnect attempts. Fixed, not exponential: this is
/// a low-traffic UI control channel with at most one connection per message.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Default bound on automatic reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default transport dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub auto_reconnect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            auto_reconnect: true,
        }
    }
}

/// Normalize a backend base URL: trimmed, no trailing slash, http(s) scheme.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ClientError::InvalidUrl("empty base URL".to_string()));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ClientError::InvalidUrl(format!(
            "base URL must use http:// or https:// scheme, got: {trimmed}"
        )));
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(ClientError::InvalidUrl(trimmed.to_string()));
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ClientError::InvalidUrl(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Derive the per-message WebSocket endpoint from the REST base URL.
///
/// `http(s)` maps to `ws(s)`; a `ws(s)` base is accepted as-is.
pub fn message_stream_url(base_url: &str, message_id: &str) -> Result<Url> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(ClientError::InvalidUrl(format!(
            "cannot derive WebSocket endpoint from: {trimmed}"
        )));
    };
    if message_id.trim().is_empty() {
        return Err(ClientError::InvalidUrl("empty message id".to_string()));
    }
    Ok(Url::parse(&format!("{ws_base}/v1/ws/messages/{message_id}"))?)
}
