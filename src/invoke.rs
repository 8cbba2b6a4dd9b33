//! Typed request/response calls.
//!
//! [`Invoker`] reads the connection from the [`ConnectionSlot`] at call time
//! and forwards the call verbatim. No retries happen here: a failed call is
//! reported to the caller, who decides whether to try again.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;

use crate::connection::{ConnectionState, HubConnection};
use crate::context::ConnectionSlot;
use crate::error::HubError;
use crate::hub::{Hub, HubMethod, IntoArguments};

/// Performs typed calls against whatever connection the slot holds.
pub struct Invoker<H: Hub> {
    slot: Arc<ConnectionSlot>,
    _hub: PhantomData<fn() -> H>,
}

impl<H: Hub> Clone for Invoker<H> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.slot))
    }
}

impl<H: Hub> fmt::Debug for Invoker<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoker").field("hub", &H::NAME).finish()
    }
}

impl<H: Hub> Invoker<H> {
    /// Create an invoker reading from `slot`.
    #[must_use]
    pub fn new(slot: Arc<ConnectionSlot>) -> Self {
        Self {
            slot,
            _hub: PhantomData,
        }
    }

    /// Call method `M` and decode its result.
    ///
    /// Fails with [`HubError::NotConnected`] when no connection is present,
    /// [`HubError::Transport`] while it is reconnecting or on transport
    /// failure, and [`HubError::RemoteInvocation`] when the remote side throws.
    pub async fn invoke<M: HubMethod<H>>(&self, args: M::Args) -> Result<M::Output, HubError> {
        let connection = self.ready_connection()?;
        let args = args.into_arguments()?;

        log::debug!("[Hub] Invoking '{}' on {}", M::NAME, H::NAME);
        let value = connection.invoke(M::NAME, args).await?;

        serde_json::from_value(value)
            .map_err(|e| HubError::Codec(format!("result of '{}': {e}", M::NAME)))
    }

    /// Call `method` by wire name with positional `args`.
    pub async fn invoke_raw(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        let connection = self.ready_connection()?;
        log::debug!("[Hub] Invoking '{}' on {}", method, H::NAME);
        connection.invoke(method, args).await
    }

    fn ready_connection(&self) -> Result<Arc<dyn HubConnection>, HubError> {
        let Some(connection) = self.slot.current() else {
            return Err(HubError::NotConnected);
        };

        match connection.state() {
            ConnectionState::Connected => Ok(connection),
            ConnectionState::Reconnecting { attempt } => Err(HubError::Transport(format!(
                "connection is reconnecting (attempt {attempt})"
            ))),
            ConnectionState::Connecting => {
                Err(HubError::Transport("connection is still connecting".into()))
            }
            ConnectionState::Disconnected => {
                Err(HubError::Transport("connection is disconnected".into()))
            }
        }
    }
}

/// An invoker curried to one method.
pub struct MethodHandle<H: Hub, M: HubMethod<H>> {
    invoker: Invoker<H>,
    _method: PhantomData<fn() -> M>,
}

impl<H: Hub, M: HubMethod<H>> Clone for MethodHandle<H, M> {
    fn clone(&self) -> Self {
        Self::new(self.invoker.clone())
    }
}

impl<H: Hub, M: HubMethod<H>> fmt::Debug for MethodHandle<H, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("hub", &H::NAME)
            .field("method", &M::NAME)
            .finish()
    }
}

impl<H: Hub, M: HubMethod<H>> MethodHandle<H, M> {
    pub(crate) fn new(invoker: Invoker<H>) -> Self {
        Self {
            invoker,
            _method: PhantomData,
        }
    }

    /// Wire name of the bound method.
    #[must_use]
    pub fn name(&self) -> &'static str {
        M::NAME
    }

    /// Call the bound method.
    pub async fn call(&self, args: M::Args) -> Result<M::Output, HubError> {
        self.invoker.invoke::<M>(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockConnection};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Offset {
        pub x: i32,
        pub y: i32,
    }

    crate::hub! {
        pub hub ExampleHub {
            methods {
                ExampleMethod = "exampleMethod"(Offset) -> String;
                Count = "count"() -> u64;
            }
            callbacks {}
        }
    }

    fn connected_invoker() -> (Invoker<ExampleHub>, Arc<MockConnection>) {
        let slot = ConnectionSlot::new();
        let mock = MockConnection::new();
        mock.set_state(ConnectionState::Connected);
        slot.publish(mock.clone());
        (Invoker::new(slot), mock)
    }

    #[tokio::test]
    async fn test_invoke_without_connection_is_not_connected() {
        let invoker = Invoker::<ExampleHub>::new(ConnectionSlot::new());
        let result = invoker
            .invoke::<ExampleMethod>((Offset { x: 1, y: 2 },))
            .await;
        assert_eq!(result, Err(HubError::NotConnected));
    }

    #[tokio::test]
    async fn test_invoke_forwards_args_and_returns_result() {
        let (invoker, mock) = connected_invoker();
        mock.respond("exampleMethod", Ok(serde_json::json!("ok")));

        let result = invoker
            .invoke::<ExampleMethod>((Offset { x: 1, y: 2 },))
            .await;
        assert_eq!(result, Ok("ok".to_string()));
        assert_eq!(
            mock.calls(),
            vec![MockCall::Invoke {
                method: "exampleMethod".into(),
                args: vec![serde_json::json!({"x": 1, "y": 2})],
            }]
        );
    }

    #[tokio::test]
    async fn test_remote_failure_propagates() {
        let (invoker, mock) = connected_invoker();
        mock.respond(
            "count",
            Err(HubError::RemoteInvocation("HubException: nope".into())),
        );

        let result = invoker.invoke::<Count>(()).await;
        assert_eq!(
            result,
            Err(HubError::RemoteInvocation("HubException: nope".into()))
        );
    }

    #[tokio::test]
    async fn test_reconnecting_fails_without_forwarding() {
        let (invoker, mock) = connected_invoker();
        mock.set_state(ConnectionState::Reconnecting { attempt: 2 });

        let result = invoker.invoke::<Count>(()).await;
        assert!(matches!(result, Err(HubError::Transport(_))));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mistyped_result_is_codec_error() {
        let (invoker, mock) = connected_invoker();
        mock.respond("count", Ok(serde_json::json!("not a number")));

        let result = invoker.invoke::<Count>(()).await;
        assert!(matches!(result, Err(HubError::Codec(_))));
    }

    #[tokio::test]
    async fn test_method_handle_calls_bound_method() {
        let (invoker, mock) = connected_invoker();
        mock.respond("count", Ok(serde_json::json!(7)));

        let count = MethodHandle::<ExampleHub, Count>::new(invoker);
        assert_eq!(count.name(), "count");
        assert_eq!(count.call(()).await, Ok(7));
    }

    #[tokio::test]
    async fn test_invoke_raw_passes_value_through() {
        let (invoker, mock) = connected_invoker();
        let payload = serde_json::json!({"nested": [1, 2, 3]});
        mock.respond("echo", Ok(payload.clone()));

        let result = invoker
            .invoke_raw("echo", vec![serde_json::json!(1)])
            .await
            .unwrap();
        assert_eq!(result, payload);
    }
}
