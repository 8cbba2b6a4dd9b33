//! Push-event handlers bound to a consumer's lifecycle.
//!
//! [`CallbackBinding`] is driven by whatever framework hosts the consumer:
//! call [`start`](CallbackBinding::start) on entry into an interest period
//! and every time the declared dependencies may have changed, and
//! [`stop`](CallbackBinding::stop) (or drop the binding) when it ends.
//!
//! The binding keeps exactly one live registration per call site:
//!
//! - unchanged dependencies (and unchanged connection): nothing happens
//! - changed dependencies or a swapped connection: the previous wrapper is
//!   deregistered, then a fresh one is registered
//! - stop: the last wrapper is deregistered once
//!
//! Each activation allocates a new wrapper around the handler, and
//! deregistration targets that wrapper by identity, so other handlers for the
//! same callback name are never disturbed.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;

use crate::connection::{HubConnection, RawHandler};
use crate::context::ConnectionSlot;
use crate::error::HubError;
use crate::hub::{FromArguments, Hub, HubCallback};

/// Wrap a typed handler into a [`RawHandler`] that decodes the event
/// arguments first. Undecodable events are logged and dropped.
pub(crate) fn wrap_handler<H, C>(handler: Arc<dyn Fn(C::Args) + Send + Sync>) -> RawHandler
where
    H: Hub,
    C: HubCallback<H>,
{
    Arc::new(move |args: &[Value]| match C::Args::from_arguments(args) {
        Ok(decoded) => handler(decoded),
        Err(e) => {
            log::warn!(
                "[Subscription] Dropping '{}' event on {}: {}",
                C::NAME,
                H::NAME,
                e
            );
        }
    })
}

/// Token for a low-level registration made with
/// [`HubContext::subscribe`](crate::HubContext::subscribe).
pub struct Subscription<H: Hub, C: HubCallback<H>> {
    handler: RawHandler,
    _marker: PhantomData<fn() -> (H, C)>,
}

impl<H: Hub, C: HubCallback<H>> Subscription<H, C> {
    pub(crate) fn new(handler: RawHandler) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }

    /// The registered wrapper.
    #[must_use]
    pub fn raw_handler(&self) -> &RawHandler {
        &self.handler
    }
}

impl<H: Hub, C: HubCallback<H>> Clone for Subscription<H, C> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.handler))
    }
}

impl<H: Hub, C: HubCallback<H>> fmt::Debug for Subscription<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("hub", &H::NAME)
            .field("callback", &C::NAME)
            .finish_non_exhaustive()
    }
}

/// The registration made by the current activation.
struct ActiveRegistration {
    connection: Arc<dyn HubConnection>,
    wrapper: RawHandler,
}

/// Lifecycle-bound handler for callback `C` of hub `H`.
pub struct CallbackBinding<H: Hub, C: HubCallback<H>> {
    slot: Arc<ConnectionSlot>,
    handler: Arc<dyn Fn(C::Args) + Send + Sync>,
    /// Slot generation and dependencies of the current activation.
    /// `None` outside an interest period.
    activation: Option<(u64, Vec<Value>)>,
    active: Option<ActiveRegistration>,
    _hub: PhantomData<fn() -> H>,
}

impl<H: Hub, C: HubCallback<H>> fmt::Debug for CallbackBinding<H, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBinding")
            .field("hub", &H::NAME)
            .field("callback", &C::NAME)
            .field("activation", &self.activation)
            .field("registered", &self.active.is_some())
            .finish()
    }
}

impl<H: Hub, C: HubCallback<H>> CallbackBinding<H, C> {
    /// Create an inactive binding reading the connection from `slot`.
    pub fn new<F>(slot: Arc<ConnectionSlot>, handler: F) -> Self
    where
        F: Fn(C::Args) + Send + Sync + 'static,
    {
        Self {
            slot,
            handler: Arc::new(handler),
            activation: None,
            active: None,
            _hub: PhantomData,
        }
    }

    /// Enter or refresh the interest period with `deps`.
    ///
    /// Dependencies are compared element by element with the previous
    /// activation. The slot generation is part of the comparison, so a
    /// published, swapped or cleared connection also re-runs the setup. With
    /// no connection present nothing is registered until a later `start`
    /// sees one.
    pub fn start(&mut self, deps: &[Value]) -> Result<(), HubError> {
        let (connection, generation) = self.slot.snapshot();

        if let Some((last_generation, last_deps)) = &self.activation {
            if *last_generation == generation && last_deps.as_slice() == deps {
                return Ok(());
            }
        }

        self.deregister();
        self.activation = Some((generation, deps.to_vec()));

        let Some(connection) = connection else {
            log::debug!(
                "[Subscription] No connection for '{}' on {}, deferring",
                C::NAME,
                H::NAME
            );
            return Ok(());
        };

        self.register(connection, generation)
    }

    /// Register a fresh wrapper on `connection`.
    ///
    /// Refuses to replace a live registration: the previous wrapper must be
    /// deregistered first, or it would stay on its connection untracked.
    fn register(
        &mut self,
        connection: Arc<dyn HubConnection>,
        generation: u64,
    ) -> Result<(), HubError> {
        if self.active.is_some() {
            return Err(HubError::SubscriptionState(format!(
                "'{}' on {} is still registered",
                C::NAME,
                H::NAME
            )));
        }

        let wrapper = wrap_handler::<H, C>(Arc::clone(&self.handler));
        connection.on(C::NAME, Arc::clone(&wrapper));
        log::debug!(
            "[Subscription] Registered '{}' on {} (generation {})",
            C::NAME,
            H::NAME,
            generation
        );
        self.active = Some(ActiveRegistration {
            connection,
            wrapper,
        });
        Ok(())
    }

    /// End the interest period, deregistering the current wrapper.
    ///
    /// Idempotent: a second call does nothing.
    pub fn stop(&mut self) {
        self.deregister();
        self.activation = None;
    }

    /// Whether a wrapper is currently registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.active.is_some()
    }

    /// Whether the binding is inside an interest period.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.activation.is_some()
    }

    fn deregister(&mut self) {
        if let Some(active) = self.active.take() {
            active.connection.off(C::NAME, Some(&active.wrapper));
            log::debug!("[Subscription] Deregistered '{}' on {}", C::NAME, H::NAME);
        }
    }
}

impl<H: Hub, C: HubCallback<H>> Drop for CallbackBinding<H, C> {
    fn drop(&mut self) {
        self.stop();
    }
}
