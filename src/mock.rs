//! In-memory hub connection for tests.
//!
//! [`MockConnection`] records every call made through the
//! [`HubConnection`] interface, returns scripted results, and lets a test
//! push events and drive the connection state by hand. [`MockFactory`] hands
//! out mock connections to a [`HubProvider`](crate::HubProvider).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use crate::config::ConnectionOptions;
use crate::connection::{
    ConnectionFactory, ConnectionState, HandlerRegistry, HubConnection, RawHandler,
};
use crate::error::HubError;

/// One call observed by a [`MockConnection`].
///
/// Handlers are identified by the address of their allocation, so the same
/// wrapper shows the same id in `On` and `Off`.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// `start` was called.
    Start,
    /// `stop` was called.
    Stop,
    /// `invoke` was called.
    Invoke {
        /// Wire name.
        method: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
    /// `on` was called.
    On {
        /// Wire name.
        method: String,
        /// Handler identity.
        handler: usize,
    },
    /// `off` was called.
    Off {
        /// Wire name.
        method: String,
        /// Handler identity, `None` for "all handlers".
        handler: Option<usize>,
    },
}

/// Identity of a handler allocation.
#[must_use]
pub fn handler_id(handler: &RawHandler) -> usize {
    Arc::as_ptr(handler).cast::<()>() as usize
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable in-memory connection.
#[derive(Debug)]
pub struct MockConnection {
    handlers: HandlerRegistry,
    calls: Mutex<Vec<MockCall>>,
    results: Mutex<HashMap<String, VecDeque<Result<Value, HubError>>>>,
    start_error: Mutex<Option<HubError>>,
    state: watch::Sender<ConnectionState>,
}

impl MockConnection {
    /// Create a disconnected mock.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: HandlerRegistry::new(),
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            start_error: Mutex::new(None),
            state: watch::channel(ConnectionState::Disconnected).0,
        })
    }

    /// Queue `result` for the next `invoke` of `method`. Unscripted calls
    /// resolve to `null`.
    pub fn respond(&self, method: &str, result: Result<Value, HubError>) {
        lock(&self.results)
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    /// Make the next `start` fail with `error`.
    pub fn fail_start_with(&self, error: HubError) {
        *lock(&self.start_error) = Some(error);
    }

    /// Deliver a push event to the registered handlers.
    pub fn emit(&self, method: &str, args: Vec<Value>) -> usize {
        self.handlers.dispatch(method, &args)
    }

    /// Force the reported connection state.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Every call observed so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Handlers currently registered for `method`.
    #[must_use]
    pub fn handler_count(&self, method: &str) -> usize {
        self.handlers.count(method)
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl HubConnection for MockConnection {
    async fn start(&self) -> Result<(), HubError> {
        self.record(MockCall::Start);
        if let Some(error) = lock(&self.start_error).take() {
            return Err(error);
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn stop(&self) {
        self.record(MockCall::Stop);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        self.record(MockCall::Invoke {
            method: method.to_string(),
            args,
        });
        lock(&self.results)
            .get_mut(method)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(Value::Null))
    }

    fn on(&self, method: &str, handler: RawHandler) {
        self.record(MockCall::On {
            method: method.to_string(),
            handler: handler_id(&handler),
        });
        self.handlers.add(method, handler);
    }

    fn off(&self, method: &str, handler: Option<&RawHandler>) {
        self.record(MockCall::Off {
            method: method.to_string(),
            handler: handler.map(handler_id),
        });
        self.handlers.remove(method, handler);
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// Connection factory producing [`MockConnection`]s.
#[derive(Debug, Default)]
pub struct MockFactory {
    built: Mutex<Vec<(Arc<MockConnection>, ConnectionOptions, bool)>>,
    fail_next_start: Mutex<Option<HubError>>,
    fail_next_build: Mutex<Option<HubError>>,
}

impl MockFactory {
    /// Create a factory.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next built connection fails its `start` with `error`.
    pub fn fail_next_start(&self, error: HubError) {
        *lock(&self.fail_next_start) = Some(error);
    }

    /// The next `build` fails with `error`.
    pub fn fail_next_build(&self, error: HubError) {
        *lock(&self.fail_next_build) = Some(error);
    }

    /// Connections built so far, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.built).iter().map(|(c, _, _)| Arc::clone(c)).collect()
    }

    /// Most recently built connection.
    #[must_use]
    pub fn last(&self) -> Option<Arc<MockConnection>> {
        lock(&self.built).last().map(|(c, _, _)| Arc::clone(c))
    }

    /// Options and auto-reconnect flag of the most recent build.
    #[must_use]
    pub fn last_build(&self) -> Option<(ConnectionOptions, bool)> {
        lock(&self.built)
            .last()
            .map(|(_, options, auto_reconnect)| (options.clone(), *auto_reconnect))
    }
}

impl ConnectionFactory for MockFactory {
    fn build(
        &self,
        options: &ConnectionOptions,
        auto_reconnect: bool,
    ) -> Result<Arc<dyn HubConnection>, HubError> {
        if let Some(error) = lock(&self.fail_next_build).take() {
            return Err(error);
        }

        let connection = MockConnection::new();
        if let Some(error) = lock(&self.fail_next_start).take() {
            connection.fail_start_with(error);
        }
        lock(&self.built).push((Arc::clone(&connection), options.clone(), auto_reconnect));
        Ok(connection)
    }
}
