//! The hub connection boundary.
//!
//! This module defines what the binding layer needs from a persistent,
//! bidirectional hub connection: request/response calls, named push-event
//! handlers, and an observable connection state. The wire protocol lives
//! behind [`HubConnection`]; see [`crate::transport`] for the default
//! WebSocket implementation and [`crate::mock`] for an in-memory one.
//!
//! # Handler identity
//!
//! Push handlers are [`RawHandler`]s (`Arc<dyn Fn>`). Two handlers are the
//! same registration only if they are the same allocation, so deregistering
//! requires the exact `Arc` that was registered (or no handler at all, which
//! removes every handler for the name).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::config::ConnectionOptions;
use crate::error::HubError;

/// Untyped push-event handler. Receives the positional arguments of one event.
pub type RawHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected: never started, stopped, or reconnection gave up.
    #[default]
    Disconnected,
    /// Initial connect and handshake in progress.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Connection lost; the transport is retrying.
    Reconnecting {
        /// Current reconnection attempt number (1-based).
        attempt: u32,
    },
}

/// A persistent hub connection.
///
/// Implementations own framing, handshake and reconnection. Handlers added
/// with [`on`](Self::on) must survive transport-level reconnects.
#[async_trait]
pub trait HubConnection: Send + Sync + fmt::Debug {
    /// Connect and complete the handshake.
    async fn start(&self) -> Result<(), HubError>;

    /// Close the connection. Pending calls fail with a transport error.
    async fn stop(&self);

    /// Call `method` with positional `args` and wait for its completion.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError>;

    /// Register `handler` for push events named `method`.
    fn on(&self, method: &str, handler: RawHandler);

    /// Deregister `handler` for `method`, or every handler when `None`.
    ///
    /// Removing a handler that is not registered is a no-op.
    fn off(&self, method: &str, handler: Option<&RawHandler>);

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Subscribe to connection state changes.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Builds unstarted connections for the provider.
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection for `options`. `auto_reconnect` enables
    /// transport-level reconnection.
    fn build(
        &self,
        options: &ConnectionOptions,
        auto_reconnect: bool,
    ) -> Result<Arc<dyn HubConnection>, HubError>;
}

/// Push-event handler table keyed by case-insensitive method name.
///
/// Shared by connection implementations. Dispatch snapshots the handler list
/// and runs it without holding the lock, so handlers may call back into the
/// registry.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<RawHandler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.lock();
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<RawHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `handler` under `method`.
    pub fn add(&self, method: &str, handler: RawHandler) {
        self.lock()
            .entry(method.to_lowercase())
            .or_default()
            .push(handler);
    }

    /// Remove `handler` (by identity) or every handler under `method`.
    ///
    /// Returns the number of handlers removed.
    pub fn remove(&self, method: &str, handler: Option<&RawHandler>) -> usize {
        let key = method.to_lowercase();
        let mut handlers = self.lock();
        let Some(list) = handlers.get_mut(&key) else {
            return 0;
        };

        let removed = match handler {
            Some(target) => {
                let before = list.len();
                list.retain(|h| !Arc::ptr_eq(h, target));
                before - list.len()
            }
            None => std::mem::take(list).len(),
        };

        if list.is_empty() {
            handlers.remove(&key);
        }
        removed
    }

    /// Number of handlers registered under `method`.
    #[must_use]
    pub fn count(&self, method: &str) -> usize {
        self.lock()
            .get(&method.to_lowercase())
            .map_or(0, Vec::len)
    }

    /// Run every handler registered under `method` with `args`, in
    /// registration order. Returns how many handlers ran.
    pub fn dispatch(&self, method: &str, args: &[Value]) -> usize {
        let snapshot: Vec<RawHandler> = match self.lock().get(&method.to_lowercase()) {
            Some(list) => list.clone(),
            None => {
                log::debug!("[Hub] No handler registered for '{}'", method);
                return 0;
            }
        };

        for handler in &snapshot {
            handler(args);
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: &Arc<AtomicUsize>) -> RawHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_args: &[Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dispatch_is_case_insensitive() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add("ReceiveMessage", counting_handler(&hits));

        assert_eq!(registry.dispatch("receivemessage", &[]), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_by_identity_keeps_other_handlers() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let first = counting_handler(&hits);
        let second = counting_handler(&hits);
        registry.add("tick", Arc::clone(&first));
        registry.add("tick", Arc::clone(&second));

        assert_eq!(registry.remove("tick", Some(&first)), 1);
        assert_eq!(registry.count("tick"), 1);

        registry.dispatch("tick", &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_without_handler_clears_name() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.add("tick", counting_handler(&hits));
        registry.add("tick", counting_handler(&hits));
        registry.add("tock", counting_handler(&hits));

        assert_eq!(registry.remove("tick", None), 2);
        assert_eq!(registry.count("tick"), 0);
        assert_eq!(registry.count("tock"), 1);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let stray = counting_handler(&hits);

        assert_eq!(registry.remove("missing", None), 0);
        assert_eq!(registry.remove("missing", Some(&stray)), 0);

        registry.add("present", counting_handler(&hits));
        assert_eq!(registry.remove("present", Some(&stray)), 0);
        assert_eq!(registry.count("present"), 1);
    }

    #[test]
    fn test_handler_may_reenter_registry() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.add(
            "once",
            Arc::new(move |_args: &[Value]| {
                inner.remove("once", None);
            }),
        );

        assert_eq!(registry.dispatch("once", &[]), 1);
        assert_eq!(registry.count("once"), 0);
    }
}
