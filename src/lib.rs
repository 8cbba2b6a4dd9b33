//! hubwire - typed bindings over a persistent hub connection.
//!
//! A hub exposes named remote methods (request/response) and pushes named
//! events to the client. This crate binds both to a compile-time hub
//! descriptor so call sites are checked against the method and callback
//! sets, while the wire only ever sees a name and a positional argument list.
//!
//! # Architecture
//!
//! - **Descriptor** - `hub!` declares the hub type and its method/callback markers
//! - **Context** - `HubContext` shares one connection slot between callers
//! - **Provider** - `HubProvider` owns the connection lifecycle and publishes it
//! - **Invoker** - typed request/response calls against the current connection
//! - **Subscriptions** - `CallbackBinding` keeps a push handler registered for
//!   exactly as long as it is wanted
//! - **Transport** - JSON hub protocol over WebSocket (swappable via
//!   `ConnectionFactory`)
//!
//! # Modules
//!
//! - [`hub`] - Descriptors and argument codecs
//! - [`context`] - Connection slot and binding context
//! - [`provider`] - Connection lifecycle state machine
//! - [`invoke`] - Remote method calls
//! - [`subscription`] - Push-event registrations
//! - [`connection`] - Connection interface and handler registry
//! - [`transport`] - Default WebSocket transport
//! - [`config`] - Connection options
//! - [`mock`] - In-memory connection for tests

// Library modules
pub mod config;
pub mod connection;
pub mod constants;
pub mod context;
pub mod error;
pub mod hub;
pub mod invoke;
pub mod mock;
pub mod provider;
pub mod subscription;
pub mod transport;

// Re-export commonly used types
pub use config::ConnectionOptions;
pub use connection::{ConnectionFactory, ConnectionState, HubConnection, RawHandler};
pub use context::{ConnectionSlot, HubContext};
pub use error::HubError;
pub use hub::{Hub, HubCallback, HubMethod};
pub use invoke::{Invoker, MethodHandle};
pub use provider::{HubProvider, ProviderProps, ProviderState};
pub use subscription::{CallbackBinding, Subscription};
pub use transport::{WsConnectionFactory, WsHubConnection};
