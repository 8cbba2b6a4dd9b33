//! Connection provider: owns the connection's lifetime for one context.
//!
//! # State machine
//!
//! ```text
//!   Idle ──activate──► Connecting ──handshake ok──► Connected ◄──┐
//!    ▲                     │                           │         │
//!    │                 failure                 transport drop    │
//!    │                (on_error)                       ▼         │
//!    │                     ▼                     Reconnecting ───┘
//!    └── disabled ──── Closed ◄── deactivate / props change / gave up
//! ```
//!
//! The provider is the only writer of the [`ConnectionSlot`]. It publishes
//! the handle once the handshake succeeds and clears it on teardown, on a
//! props change, or when the transport gives up reconnecting. While the
//! transport is reconnecting the handle stays published; calls fail with a
//! transport error until the connection is back.

// Rust guideline compliant 2026-02

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConnectionOptions;
use crate::connection::{ConnectionFactory, ConnectionState, HubConnection};
use crate::context::ConnectionSlot;
use crate::error::HubError;
use crate::hub::Hub;

/// Callback for connect and handshake failures.
pub type ErrorCallback = Arc<dyn Fn(&HubError) + Send + Sync>;

/// Provider lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderState {
    /// Not activated, or activated with connecting disabled before any
    /// connection was made.
    #[default]
    Idle,
    /// Building the connection and waiting for the handshake.
    Connecting,
    /// Connection published and ready.
    Connected,
    /// Transport lost the connection and is retrying.
    Reconnecting,
    /// Torn down, failed to connect, or the transport gave up.
    Closed,
}

/// Provider-level options.
#[derive(Clone)]
pub struct ProviderProps {
    /// Transport configuration passed through to the factory.
    pub options: ConnectionOptions,
    /// Whether a connection should be attempted at all.
    pub connect_enabled: bool,
    /// Enable transport-level reconnection.
    pub auto_reconnect: bool,
    /// Changing any element tears down and reconnects.
    pub dependencies: Vec<Value>,
    /// Called when building or starting the connection fails.
    pub on_error: Option<ErrorCallback>,
}

impl fmt::Debug for ProviderProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderProps")
            .field("options", &self.options)
            .field("connect_enabled", &self.connect_enabled)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("dependencies", &self.dependencies)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl ProviderProps {
    /// Props for `options` with connecting and reconnection enabled.
    #[must_use]
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            connect_enabled: true,
            auto_reconnect: true,
            dependencies: Vec::new(),
            on_error: None,
        }
    }

    /// Gate whether a connection is attempted.
    pub fn with_connect_enabled(mut self, enabled: bool) -> Self {
        self.connect_enabled = enabled;
        self
    }

    /// Enable or disable transport-level reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Values whose change forces a reconnect.
    pub fn with_dependencies(mut self, dependencies: Vec<Value>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Failure callback.
    pub fn with_on_error(mut self, on_error: impl Fn(&HubError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    fn activation_key(&self) -> ActivationKey {
        ActivationKey {
            connect_enabled: self.connect_enabled,
            endpoint: self.options.endpoint.clone(),
            dependencies: self.dependencies.clone(),
        }
    }

    fn report(&self, error: &HubError) {
        log::warn!(
            "[HubProvider] Connect to {} failed: {}",
            self.options.endpoint,
            error
        );
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }
}

/// Values whose change re-runs the connect cycle.
#[derive(Debug, Clone, PartialEq)]
struct ActivationKey {
    connect_enabled: bool,
    endpoint: String,
    dependencies: Vec<Value>,
}

/// The connection this provider currently owns.
struct ActiveConnection {
    connection: Arc<dyn HubConnection>,
    watcher: JoinHandle<()>,
}

/// Owns connection construction and teardown for one [`HubContext`](crate::HubContext).
pub struct HubProvider<H: Hub> {
    slot: Arc<ConnectionSlot>,
    factory: Arc<dyn ConnectionFactory>,
    state: Arc<watch::Sender<ProviderState>>,
    active: Option<ActiveConnection>,
    last_key: Option<ActivationKey>,
    _hub: PhantomData<fn() -> H>,
}

impl<H: Hub> fmt::Debug for HubProvider<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubProvider")
            .field("hub", &H::NAME)
            .field("state", &self.state())
            .field("last_key", &self.last_key)
            .finish_non_exhaustive()
    }
}

impl<H: Hub> HubProvider<H> {
    /// Create an idle provider writing into `slot`.
    #[must_use]
    pub fn new(slot: Arc<ConnectionSlot>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            slot,
            factory,
            state: Arc::new(watch::channel(ProviderState::Idle).0),
            active: None,
            last_key: None,
            _hub: PhantomData,
        }
    }

    /// Current provider state.
    #[must_use]
    pub fn state(&self) -> ProviderState {
        *self.state.borrow()
    }

    /// Subscribe to provider state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ProviderState> {
        self.state.subscribe()
    }

    /// Begin or refresh the interest period with `props`.
    ///
    /// A no-op when `connect_enabled`, the endpoint and the dependencies
    /// all equal the previous activation. Otherwise the current connection
    /// is torn down and, if enabled, a new one is connected. Failures are
    /// reported through `on_error` and never returned.
    pub async fn activate(&mut self, props: ProviderProps) {
        let key = props.activation_key();
        if self.last_key.as_ref() == Some(&key) {
            return;
        }

        let was_live = self.active.is_some();
        self.teardown().await;
        self.last_key = Some(key);

        if !props.connect_enabled {
            log::info!("[HubProvider] Connecting disabled for {}", H::NAME);
            // A torn-down connection ends in Closed; never connected stays Idle.
            if !was_live {
                self.state.send_replace(ProviderState::Idle);
            }
            return;
        }

        self.connect(&props).await;
    }

    /// End the interest period: clear the slot and close the connection.
    pub async fn deactivate(&mut self) {
        self.teardown().await;
        self.last_key = None;
        self.state.send_replace(ProviderState::Closed);
    }

    async fn connect(&mut self, props: &ProviderProps) {
        self.state.send_replace(ProviderState::Connecting);
        log::info!(
            "[HubProvider] Connecting {} to {}",
            H::NAME,
            props.options.endpoint
        );

        let connection = match self.factory.build(&props.options, props.auto_reconnect) {
            Ok(connection) => connection,
            Err(e) => {
                props.report(&e);
                self.state.send_replace(ProviderState::Closed);
                return;
            }
        };

        if let Err(e) = connection.start().await {
            props.report(&e);
            connection.stop().await;
            self.state.send_replace(ProviderState::Closed);
            return;
        }

        let generation = self.slot.publish(Arc::clone(&connection));
        self.state.send_replace(ProviderState::Connected);
        log::info!(
            "[HubProvider] {} connected (generation {})",
            H::NAME,
            generation
        );

        let watcher = tokio::spawn(follow_connection(
            Arc::clone(&connection),
            Arc::clone(&self.slot),
            Arc::clone(&self.state),
            H::NAME,
        ));
        self.active = Some(ActiveConnection {
            connection,
            watcher,
        });
    }

    async fn teardown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.watcher.abort();
        self.slot.clear_if(&active.connection);
        active.connection.stop().await;
        self.state.send_replace(ProviderState::Closed);
        log::info!("[HubProvider] {} connection closed", H::NAME);
    }
}

impl<H: Hub> Drop for HubProvider<H> {
    fn drop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.watcher.abort();
        self.slot.clear_if(&active.connection);

        // Stopping is async; hand it to the runtime when one is available.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connection = active.connection;
            handle.spawn(async move { connection.stop().await });
        }
    }
}

/// Mirror transport state into the provider and clear the slot when the
/// transport gives up.
async fn follow_connection(
    connection: Arc<dyn HubConnection>,
    slot: Arc<ConnectionSlot>,
    state: Arc<watch::Sender<ProviderState>>,
    hub: &'static str,
) {
    let mut changes = connection.watch_state();
    loop {
        let current = *changes.borrow_and_update();
        match current {
            ConnectionState::Connected => {
                if state.send_replace(ProviderState::Connected) == ProviderState::Reconnecting {
                    log::info!("[HubProvider] {} reconnected", hub);
                }
            }
            ConnectionState::Reconnecting { attempt } => {
                log::info!("[HubProvider] {} reconnecting (attempt {})", hub, attempt);
                state.send_replace(ProviderState::Reconnecting);
            }
            ConnectionState::Disconnected => {
                if slot.clear_if(&connection) {
                    log::warn!("[HubProvider] {} connection lost for good", hub);
                }
                state.send_replace(ProviderState::Closed);
                return;
            }
            ConnectionState::Connecting => {}
        }

        if changes.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockFactory};
    use std::sync::Mutex;
    use std::time::Duration;

    crate::hub! {
        pub hub StatusHub {
            methods {}
            callbacks {}
        }
    }

    fn provider(factory: &Arc<MockFactory>) -> (HubProvider<StatusHub>, Arc<ConnectionSlot>) {
        let slot = ConnectionSlot::new();
        let provider = HubProvider::new(Arc::clone(&slot), Arc::clone(factory) as Arc<dyn ConnectionFactory>);
        (provider, slot)
    }

    fn props() -> ProviderProps {
        ProviderProps::new(ConnectionOptions::new("http://localhost:3000/hub"))
    }

    async fn wait_for(provider: &HubProvider<StatusHub>, expected: ProviderState) {
        let mut changes = provider.watch_state();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *changes.borrow_and_update() != expected {
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("provider never reached {expected:?}"));
    }

    #[tokio::test]
    async fn test_activate_publishes_connection() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);
        assert_eq!(provider.state(), ProviderState::Idle);

        provider.activate(props()).await;

        assert_eq!(provider.state(), ProviderState::Connected);
        assert!(slot.current().is_some());
        assert_eq!(factory.connections().len(), 1);
        let (_, auto_reconnect) = factory.last_build().unwrap();
        assert!(auto_reconnect);
    }

    #[tokio::test]
    async fn test_same_props_do_not_reconnect() {
        let factory = MockFactory::new();
        let (mut provider, _slot) = provider(&factory);

        provider.activate(props()).await;
        provider.activate(props()).await;

        assert_eq!(factory.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_change_replaces_connection() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);

        provider.activate(props()).await;
        let first_generation = slot.generation();
        provider
            .activate(props().with_dependencies(vec![serde_json::json!("room-2")]))
            .await;

        let built = factory.connections();
        assert_eq!(built.len(), 2);
        assert!(built[0].calls().contains(&MockCall::Stop));
        assert!(slot.generation() > first_generation);
        assert_eq!(provider.state(), ProviderState::Connected);
    }

    #[tokio::test]
    async fn test_disabled_connects_nothing() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);

        provider.activate(props().with_connect_enabled(false)).await;

        assert_eq!(provider.state(), ProviderState::Idle);
        assert!(factory.connections().is_empty());
        assert!(slot.current().is_none());
    }

    #[tokio::test]
    async fn test_disabling_tears_down() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);

        provider.activate(props()).await;
        let connection = factory.last().unwrap();
        provider.activate(props().with_connect_enabled(false)).await;

        assert!(slot.current().is_none());
        assert!(connection.calls().contains(&MockCall::Stop));
        assert_eq!(provider.state(), ProviderState::Closed);
        assert_eq!(factory.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_calls_on_error() {
        let factory = MockFactory::new();
        factory.fail_next_start(HubError::Transport("handshake rejected".into()));
        let (mut provider, slot) = provider(&factory);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider
            .activate(props().with_on_error(move |e| sink.lock().unwrap().push(e.clone())))
            .await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![HubError::Transport("handshake rejected".into())]
        );
        assert!(slot.current().is_none());
        assert_eq!(provider.state(), ProviderState::Closed);
    }

    #[tokio::test]
    async fn test_build_failure_calls_on_error() {
        let factory = MockFactory::new();
        factory.fail_next_build(HubError::Transport("bad endpoint".into()));
        let (mut provider, _slot) = provider(&factory);

        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        provider
            .activate(props().with_on_error(move |_| *sink.lock().unwrap() += 1))
            .await;

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(provider.state(), ProviderState::Closed);
    }

    #[tokio::test]
    async fn test_deactivate_clears_slot() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);

        provider.activate(props()).await;
        provider.deactivate().await;

        assert!(slot.current().is_none());
        assert_eq!(provider.state(), ProviderState::Closed);
        assert!(factory.last().unwrap().calls().contains(&MockCall::Stop));
    }

    #[tokio::test]
    async fn test_reconnecting_keeps_handle_present() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);
        provider.activate(props()).await;
        let connection = factory.last().unwrap();

        connection.set_state(ConnectionState::Reconnecting { attempt: 1 });
        wait_for(&provider, ProviderState::Reconnecting).await;
        assert!(slot.current().is_some());

        connection.set_state(ConnectionState::Connected);
        wait_for(&provider, ProviderState::Connected).await;
        assert!(slot.current().is_some());
    }

    #[tokio::test]
    async fn test_fatal_disconnect_clears_slot() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);
        provider.activate(props()).await;

        factory
            .last()
            .unwrap()
            .set_state(ConnectionState::Disconnected);
        wait_for(&provider, ProviderState::Closed).await;
        assert!(slot.current().is_none());
    }

    #[tokio::test]
    async fn test_drop_clears_slot() {
        let factory = MockFactory::new();
        let (mut provider, slot) = provider(&factory);
        provider.activate(props()).await;

        drop(provider);
        assert!(slot.current().is_none());
    }
}
