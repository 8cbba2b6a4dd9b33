//! Connection configuration.
//!
//! [`ConnectionOptions`] is the transport-facing configuration bag consumed by
//! a [`ConnectionFactory`](crate::connection::ConnectionFactory): endpoint,
//! upgrade headers, authentication and timing. It can be built in code, loaded
//! from a JSON file, and overridden from the environment.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Produces a fresh access token for each connect attempt.
pub type AccessTokenFactory = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// WebSocket transport (the only one supported).
    #[default]
    WebSockets,
}

impl TransportKind {
    /// Name used by the negotiate response's `availableTransports`.
    #[must_use]
    pub fn negotiate_name(self) -> &'static str {
        match self {
            Self::WebSockets => "WebSockets",
        }
    }
}

/// Options for building a hub connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Hub URL (`http(s)://` or `ws(s)://`).
    pub endpoint: String,
    /// Extra headers sent with negotiate and the WebSocket upgrade.
    pub headers: BTreeMap<String, String>,
    /// Static access token. Ignored when `access_token_factory` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Token callback, consulted on every connect attempt.
    #[serde(skip)]
    pub access_token_factory: Option<AccessTokenFactory>,
    /// Connect directly over WebSocket without the negotiate request.
    pub skip_negotiation: bool,
    /// Transport to use.
    pub transport: TransportKind,
    /// Upper bound on the protocol handshake.
    pub handshake_timeout_ms: u64,
    /// Interval between client keep-alive pings.
    pub keep_alive_interval_ms: u64,
    /// Silence after which the server is considered gone.
    pub server_timeout_ms: u64,
    /// Delays before each automatic reconnect attempt.
    pub reconnect_delays_ms: Vec<u64>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("endpoint", &self.endpoint)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("access_token_factory", &self.access_token_factory.is_some())
            .field("skip_negotiation", &self.skip_negotiation)
            .field("transport", &self.transport)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("keep_alive_interval_ms", &self.keep_alive_interval_ms)
            .field("server_timeout_ms", &self.server_timeout_ms)
            .field("reconnect_delays_ms", &self.reconnect_delays_ms)
            .finish()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: BTreeMap::new(),
            access_token: None,
            access_token_factory: None,
            skip_negotiation: false,
            transport: TransportKind::default(),
            handshake_timeout_ms: duration_ms(constants::HANDSHAKE_TIMEOUT),
            keep_alive_interval_ms: duration_ms(constants::KEEP_ALIVE_INTERVAL),
            server_timeout_ms: duration_ms(constants::SERVER_TIMEOUT),
            reconnect_delays_ms: constants::DEFAULT_RECONNECT_DELAYS
                .iter()
                .copied()
                .map(duration_ms)
                .collect(),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ConnectionOptions {
    /// Options for `endpoint` with default timing.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Add an upgrade/negotiate header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Use a static access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Use a token callback.
    pub fn with_access_token_factory(
        mut self,
        factory: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.access_token_factory = Some(Arc::new(factory));
        self
    }

    /// Skip the negotiate request.
    pub fn with_skip_negotiation(mut self, skip: bool) -> Self {
        self.skip_negotiation = skip;
        self
    }

    /// Load options from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read hub config {}", path.display()))?;
        let mut options: Self = serde_json::from_str(&content)
            .with_context(|| format!("invalid hub config {}", path.display()))?;
        options.apply_env_overrides();
        Ok(options)
    }

    /// Apply `HUBWIRE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("HUBWIRE_ENDPOINT") {
            self.endpoint = endpoint;
        }

        if let Ok(token) = std::env::var("HUBWIRE_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }

        if let Ok(skip) = std::env::var("HUBWIRE_SKIP_NEGOTIATION") {
            if let Ok(skip) = skip.parse::<bool>() {
                self.skip_negotiation = skip;
            }
        }
    }

    /// Resolve the token for one connect attempt.
    #[must_use]
    pub fn resolve_access_token(&self) -> Option<String> {
        match &self.access_token_factory {
            Some(factory) => factory(),
            None => self.access_token.clone(),
        }
    }

    /// Handshake timeout as a `Duration`.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Keep-alive interval as a `Duration`.
    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Server timeout as a `Duration`.
    #[must_use]
    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    /// Reconnect delays as `Duration`s.
    #[must_use]
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}
