//! Client configuration from environment variables.

use std::time::Duration;

use cinebudget_shared::{is_local_address, SyncError};
use url::Url;

use crate::ws::{HeartbeatConfig, ReconnectConfig};

const DEFAULT_HOST: &str = "localhost:8000";
const REFRESH_PATH: &str = "/api/token/refresh/";

/// How the project socket proves who is connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsAuthMode {
    /// `?token=<access>` on the socket URL.
    QueryToken,
    /// `{"type":"authentication","token":...}` as the first frame after open.
    AuthFrame,
}

impl WsAuthMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "query" | "query_token" => Some(WsAuthMode::QueryToken),
            "frame" | "auth_frame" => Some(WsAuthMode::AuthFrame),
            _ => None,
        }
    }
}

/// Settings for the expense sync client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend host, with optional port (e.g. `api.cinebudget.app`).
    pub host: String,
    /// Use `https`/`wss` instead of `http`/`ws`.
    pub tls: bool,
    pub auth_mode: WsAuthMode,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    /// Delay before reconnecting after a 4001 close and a successful refresh.
    pub auth_retry_delay: Duration,
    /// Timeout for HTTP calls (token refresh, REST).
    pub http_timeout: Duration,
}

impl SyncConfig {
    /// Configuration for `host`. A scheme prefix decides TLS; without one,
    /// local/private addresses use plain transport and everything else TLS.
    pub fn new(host: impl AsRef<str>) -> Self {
        let (host, tls) = split_scheme(host.as_ref());
        Self {
            host,
            tls,
            auth_mode: WsAuthMode::QueryToken,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            auth_retry_delay: Duration::from_millis(1000),
            http_timeout: Duration::from_secs(30),
        }
    }

    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CINEBUDGET_API_HOST`: backend host (default: "localhost:8000")
    /// - `CINEBUDGET_TLS`: "true" | "false" (default: derived from the host)
    /// - `CINEBUDGET_WS_AUTH`: "query" | "frame" (default: "query")
    /// - `CINEBUDGET_HTTP_TIMEOUT_SECS`: HTTP timeout in seconds (default: 30)
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let host = var("CINEBUDGET_API_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let mut config = Self::new(host);

        if let Some(tls) = var("CINEBUDGET_TLS") {
            match tls.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.tls = true,
                "0" | "false" | "no" | "off" => config.tls = false,
                other => tracing::warn!(value = other, "ignoring unrecognized CINEBUDGET_TLS"),
            }
        }

        if let Some(mode) = var("CINEBUDGET_WS_AUTH") {
            match WsAuthMode::parse(&mode) {
                Some(mode) => config.auth_mode = mode,
                None => tracing::warn!(value = %mode, "ignoring unrecognized CINEBUDGET_WS_AUTH"),
            }
        }

        if let Some(secs) = var("CINEBUDGET_HTTP_TIMEOUT_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(secs) => config.http_timeout = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %secs, "ignoring invalid CINEBUDGET_HTTP_TIMEOUT_SECS"),
            }
        }

        config
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_auth_mode(mut self, auth_mode: WsAuthMode) -> Self {
        self.auth_mode = auth_mode;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Base URL for REST calls, without a trailing slash.
    pub fn http_base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.host)
    }

    /// Endpoint that exchanges a refresh token for a new pair.
    pub fn refresh_url(&self) -> String {
        format!("{}{}", self.http_base_url(), REFRESH_PATH)
    }

    /// Socket URL for one project's channel.
    ///
    /// The access token is only embedded in [`WsAuthMode::QueryToken`] mode.
    pub fn ws_url(&self, project_id: &str, access_token: &str) -> Result<Url, SyncError> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}/", scheme, self.host))
            .map_err(|e| SyncError::Transport(format!("invalid host {:?}: {e}", self.host)))?;

        url.path_segments_mut()
            .map_err(|_| SyncError::Transport(format!("host {:?} cannot be a base URL", self.host)))?
            .pop_if_empty()
            .extend(["ws", "project", project_id, ""]);

        if self.auth_mode == WsAuthMode::QueryToken {
            url.query_pairs_mut().append_pair("token", access_token);
        }
        Ok(url)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST)
    }
}

/// Strip any scheme from `raw`, returning the bare host and whether TLS applies.
fn split_scheme(raw: &str) -> (String, bool) {
    let raw = raw.trim().trim_end_matches('/');
    for (prefix, tls) in [
        ("https://", true),
        ("wss://", true),
        ("http://", false),
        ("ws://", false),
    ] {
        if let Some(host) = raw.strip_prefix(prefix) {
            return (host.to_string(), tls);
        }
    }
    (raw.to_string(), !is_local_address(raw))
}
