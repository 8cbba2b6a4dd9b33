//! Binding context: the per-hub holder every derived operation reads from.
//!
//! Construction is two-phase. The [`ConnectionSlot`] is created first and
//! starts empty; the invoker, subscription bindings and provider are then
//! built around a shared reference to it. The provider is the only writer:
//! it publishes the live connection after the handshake and clears it on
//! teardown or fatal disconnect. Readers re-check the slot on every call,
//! so an operation created before the connection existed still sees it.
//!
//! ```text
//!   HubProvider ──publish/clear──► ConnectionSlot ◄──read── Invoker
//!                                        ▲                  MethodHandle
//!                                        └──────read──────  CallbackBinding
//!                                                           subscribe/unsubscribe
//! ```

// Rust guideline compliant 2026-02

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::connection::{ConnectionFactory, ConnectionState, HubConnection, RawHandler};
use crate::error::HubError;
use crate::hub::{Hub, HubCallback, HubMethod};
use crate::invoke::{Invoker, MethodHandle};
use crate::provider::HubProvider;
use crate::subscription::{self, CallbackBinding, Subscription};
use crate::transport::WsConnectionFactory;

#[derive(Default)]
struct SlotState {
    connection: Option<Arc<dyn HubConnection>>,
    generation: u64,
}

/// Shared mutable holder for the (possibly absent) connection handle.
///
/// The generation increases on every publish and clear. Subscription
/// bindings fold it into their dependency comparison, so swapping or
/// dropping the connection forces re-registration.
#[derive(Default)]
pub struct ConnectionSlot {
    state: RwLock<SlotState>,
}

impl fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("ConnectionSlot")
            .field("present", &state.connection.is_some())
            .field("generation", &state.generation)
            .finish()
    }
}

impl ConnectionSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SlotState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SlotState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<dyn HubConnection>> {
        self.read().connection.clone()
    }

    /// Current connection together with the generation it was read at.
    #[must_use]
    pub fn snapshot(&self) -> (Option<Arc<dyn HubConnection>>, u64) {
        let state = self.read();
        (state.connection.clone(), state.generation)
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Publish `connection`, replacing whatever was there. Returns the new
    /// generation.
    pub fn publish(&self, connection: Arc<dyn HubConnection>) -> u64 {
        let mut state = self.write();
        state.connection = Some(connection);
        state.generation += 1;
        state.generation
    }

    /// Clear the slot. Returns the connection that was present.
    pub fn clear(&self) -> Option<Arc<dyn HubConnection>> {
        let mut state = self.write();
        let previous = state.connection.take();
        if previous.is_some() {
            state.generation += 1;
        }
        previous
    }

    /// Clear the slot only if it still holds `connection`.
    ///
    /// Returns whether the slot was cleared.
    pub fn clear_if(&self, connection: &Arc<dyn HubConnection>) -> bool {
        let mut state = self.write();
        match &state.connection {
            Some(current) if Arc::ptr_eq(current, connection) => {
                state.connection = None;
                state.generation += 1;
                true
            }
            _ => false,
        }
    }
}

/// Typed binding context for hub `H`.
///
/// Cheap to clone; clones share the same [`ConnectionSlot`]. Consumers obtain
/// typed operations from here and never touch the connection handle.
pub struct HubContext<H: Hub> {
    slot: Arc<ConnectionSlot>,
    invoker: Invoker<H>,
}

impl<H: Hub> Clone for HubContext<H> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            invoker: self.invoker.clone(),
        }
    }
}

impl<H: Hub> fmt::Debug for HubContext<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubContext")
            .field("hub", &H::NAME)
            .field("slot", &self.slot)
            .finish()
    }
}

impl<H: Hub> Default for HubContext<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hub> HubContext<H> {
    /// Create a context with no connection.
    #[must_use]
    pub fn new() -> Self {
        let slot = ConnectionSlot::new();
        let invoker = Invoker::new(Arc::clone(&slot));
        Self { slot, invoker }
    }

    /// The shared connection holder.
    #[must_use]
    pub fn slot(&self) -> &Arc<ConnectionSlot> {
        &self.slot
    }

    /// The connection currently published by the provider.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<dyn HubConnection>> {
        self.slot.current()
    }

    /// Whether a connection is present and reports `Connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slot
            .current()
            .is_some_and(|c| c.state() == ConnectionState::Connected)
    }

    /// The invoker bound to this context.
    #[must_use]
    pub fn invoker(&self) -> &Invoker<H> {
        &self.invoker
    }

    /// Call remote method `M`.
    pub async fn invoke<M: HubMethod<H>>(&self, args: M::Args) -> Result<M::Output, HubError> {
        self.invoker.invoke::<M>(args).await
    }

    /// Curried invoker bound to method `M`.
    #[must_use]
    pub fn method<M: HubMethod<H>>(&self) -> MethodHandle<H, M> {
        MethodHandle::new(self.invoker.clone())
    }

    /// Lifecycle-bound handler for callback `C`.
    ///
    /// Nothing is registered until the host calls
    /// [`CallbackBinding::start`].
    pub fn callback<C, F>(&self, handler: F) -> CallbackBinding<H, C>
    where
        C: HubCallback<H>,
        F: Fn(C::Args) + Send + Sync + 'static,
    {
        CallbackBinding::new(Arc::clone(&self.slot), handler)
    }

    /// Register `handler` for callback `C` on the current connection.
    ///
    /// Not lifecycle-bound: the registration stays until
    /// [`unsubscribe`](Self::unsubscribe) or the connection goes away.
    pub fn subscribe<C, F>(&self, handler: F) -> Result<Subscription<H, C>, HubError>
    where
        C: HubCallback<H>,
        F: Fn(C::Args) + Send + Sync + 'static,
    {
        let wrapper = subscription::wrap_handler::<H, C>(Arc::new(handler));
        self.subscribe_raw(C::NAME, Arc::clone(&wrapper))?;
        Ok(Subscription::new(wrapper))
    }

    /// Deregister `subscription`, or every handler for `C` when `None`.
    ///
    /// A no-op when no connection is present or nothing matches.
    pub fn unsubscribe<C: HubCallback<H>>(&self, subscription: Option<&Subscription<H, C>>) {
        self.unsubscribe_raw(C::NAME, subscription.map(Subscription::raw_handler));
    }

    /// Untyped registration by wire name.
    pub fn subscribe_raw(&self, method: &str, handler: RawHandler) -> Result<(), HubError> {
        let Some(connection) = self.slot.current() else {
            return Err(HubError::NotConnected);
        };
        connection.on(method, handler);
        log::debug!("[Hub] Subscribed to '{}' on {}", method, H::NAME);
        Ok(())
    }

    /// Untyped deregistration by wire name.
    pub fn unsubscribe_raw(&self, method: &str, handler: Option<&RawHandler>) {
        if let Some(connection) = self.slot.current() {
            connection.off(method, handler);
            log::debug!("[Hub] Unsubscribed from '{}' on {}", method, H::NAME);
        }
    }

    /// Provider that connects over the default WebSocket transport.
    #[must_use]
    pub fn provider(&self) -> HubProvider<H> {
        self.provider_with(Arc::new(WsConnectionFactory))
    }

    /// Provider using a custom connection factory.
    #[must_use]
    pub fn provider_with(&self, factory: Arc<dyn ConnectionFactory>) -> HubProvider<H> {
        HubProvider::new(Arc::clone(&self.slot), factory)
    }
}
