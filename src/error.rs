//! Error taxonomy for hub operations.
//!
//! Every public operation in the crate reports failures through [`HubError`].
//! Transport internals work with `anyhow` and are folded into
//! [`HubError::Transport`] at the connection boundary.

/// Errors that can occur while calling into or subscribing to a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// No connection is present in the binding context.
    NotConnected,
    /// Handshake, reconnect, or mid-call transport failure.
    Transport(String),
    /// The remote endpoint rejected the call or threw while handling it.
    RemoteInvocation(String),
    /// Internal subscription invariant violated (double registration for one
    /// call site). Indicates a bug in the lifecycle host.
    SubscriptionState(String),
    /// Arguments could not be encoded, or a result/event payload could not be
    /// decoded into the declared type.
    Codec(String),
}

impl HubError {
    /// Wrap an `anyhow` chain as a transport failure, keeping the full context.
    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }

    /// Whether this error came from the transport rather than the remote side.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected to hub"),
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::RemoteInvocation(msg) => write!(f, "Remote invocation failed: {msg}"),
            Self::SubscriptionState(msg) => write!(f, "Subscription state error: {msg}"),
            Self::Codec(msg) => write!(f, "Codec error: {msg}"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
