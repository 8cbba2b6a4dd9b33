//! Hub descriptors: the closed sets of remote methods and push callbacks.
//!
//! A descriptor is a zero-sized type implementing [`Hub`]. Every remote method
//! is a marker type implementing [`HubMethod`] for that descriptor, and every
//! server-pushed callback a marker implementing [`HubCallback`]. The markers
//! carry the wire name plus the argument tuple and result type, so a call site
//! that names an unknown method, passes the wrong arguments, or expects the
//! wrong result does not compile. At runtime only the wire name string and a
//! `Vec<serde_json::Value>` of arguments remain.
//!
//! Use [`hub!`](crate::hub!) to declare a descriptor and its markers together:
//!
//! ```
//! use hubwire::{Hub, HubContext, HubMethod};
//!
//! hubwire::hub! {
//!     /// Chat hub exposed by the server.
//!     pub hub ChatHub {
//!         methods {
//!             /// Post a message to a room.
//!             SendMessage = "sendMessage"(String, String) -> u64;
//!         }
//!         callbacks {
//!             /// A message was posted.
//!             MessagePosted = "messagePosted"(String, String);
//!         }
//!     }
//! }
//!
//! assert_eq!(ChatHub::METHODS, &["sendMessage"]);
//! assert_eq!(<SendMessage as HubMethod<ChatHub>>::NAME, "sendMessage");
//!
//! let context = HubContext::<ChatHub>::new();
//! assert!(!context.is_connected());
//! ```
//!
//! Markers are bound to one descriptor. Passing a method declared for another
//! hub is rejected:
//!
//! ```compile_fail
//! use hubwire::{hub, HubContext};
//!
//! hub! { pub hub Alpha { methods { Ping = "ping"() -> (); } callbacks {} } }
//! hub! { pub hub Beta { methods {} callbacks {} } }
//!
//! async fn call(ctx: HubContext<Beta>) {
//!     let _ = ctx.invoke::<Ping>(()).await;
//! }
//! ```

// Rust guideline compliant 2026-02

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::HubError;

/// A hub descriptor.
///
/// `METHODS` and `CALLBACKS` are the erased runtime dictionaries of wire names.
/// The two sets are separate namespaces and may share spellings.
pub trait Hub: Send + Sync + 'static {
    /// Descriptor name, used in log output.
    const NAME: &'static str;
    /// Wire names of every remote-callable method.
    const METHODS: &'static [&'static str];
    /// Wire names of every server-pushed callback.
    const CALLBACKS: &'static [&'static str];
}

/// A caller-initiated remote method of hub `H`.
pub trait HubMethod<H: Hub>: 'static {
    /// Wire name of the method.
    const NAME: &'static str;
    /// Argument tuple.
    type Args: IntoArguments + Send;
    /// Decoded result. Use `()` for methods without a result.
    type Output: DeserializeOwned + Send;
}

/// A callee-initiated push callback of hub `H`.
pub trait HubCallback<H: Hub>: 'static {
    /// Wire name of the callback.
    const NAME: &'static str;
    /// Argument tuple delivered to handlers.
    type Args: FromArguments + Send;
}

/// Encodes an argument tuple into the positional wire representation.
pub trait IntoArguments {
    /// Serialize each element in order.
    fn into_arguments(self) -> Result<Vec<Value>, HubError>;
}

/// Decodes a positional argument list into a typed tuple.
pub trait FromArguments: Sized {
    /// Deserialize `args`, failing when the arity or any element type differs.
    fn from_arguments(args: &[Value]) -> Result<Self, HubError>;
}

macro_rules! impl_arguments {
    ($len:literal; $($ty:ident $var:ident $idx:tt),*) => {
        impl<$($ty: Serialize),*> IntoArguments for ($($ty,)*) {
            fn into_arguments(self) -> Result<Vec<Value>, HubError> {
                let ($($var,)*) = self;
                Ok(vec![$(serde_json::to_value($var)?),*])
            }
        }

        impl<$($ty: DeserializeOwned),*> FromArguments for ($($ty,)*) {
            fn from_arguments(args: &[Value]) -> Result<Self, HubError> {
                if args.len() != $len {
                    return Err(HubError::Codec(format!(
                        "expected {} argument(s), received {}",
                        $len,
                        args.len()
                    )));
                }
                Ok(($(serde_json::from_value::<$ty>(args[$idx].clone())?,)*))
            }
        }
    };
}

impl_arguments!(0;);
impl_arguments!(1; A a 0);
impl_arguments!(2; A a 0, B b 1);
impl_arguments!(3; A a 0, B b 1, C c 2);
impl_arguments!(4; A a 0, B b 1, C c 2, D d 3);
impl_arguments!(5; A a 0, B b 1, C c 2, D d 3, E e 4);
impl_arguments!(6; A a 0, B b 1, C c 2, D d 3, E e 4, F f 5);
impl_arguments!(7; A a 0, B b 1, C c 2, D d 3, E e 4, F f 5, G g 6);
impl_arguments!(8; A a 0, B b 1, C c 2, D d 3, E e 4, F f 5, G g 6, H h 7);

/// Whether every name in `names` is distinct, ignoring ASCII case.
///
/// Hub method and callback names are matched case-insensitively on the wire,
/// so `Foo` and `foo` collide. Evaluated at compile time by [`hub!`](crate::hub!).
#[doc(hidden)]
pub const fn names_unique(names: &[&str]) -> bool {
    let mut i = 0;
    while i < names.len() {
        let mut j = i + 1;
        while j < names.len() {
            if names_equal(names[i], names[j]) {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const fn names_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i].to_ascii_lowercase() != b[i].to_ascii_lowercase() {
            return false;
        }
        i += 1;
    }
    true
}

/// Declare a hub descriptor together with its method and callback markers.
///
/// Methods are written `Marker = "wireName"(ArgTy, ...) -> OutputTy;` and
/// callbacks `Marker = "wireName"(ArgTy, ...);`. Duplicate wire names within
/// one set fail compilation.
#[macro_export]
macro_rules! hub {
    (
        $(#[$hub_meta:meta])*
        $vis:vis hub $hub:ident {
            methods {
                $(
                    $(#[$m_meta:meta])*
                    $method:ident = $m_name:literal ( $($m_arg:ty),* ) -> $m_out:ty;
                )*
            }
            callbacks {
                $(
                    $(#[$c_meta:meta])*
                    $callback:ident = $c_name:literal ( $($c_arg:ty),* );
                )*
            }
        }
    ) => {
        $(#[$hub_meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $hub;

        impl $crate::hub::Hub for $hub {
            const NAME: &'static str = stringify!($hub);
            const METHODS: &'static [&'static str] = &[$($m_name),*];
            const CALLBACKS: &'static [&'static str] = &[$($c_name),*];
        }

        const _: () = assert!(
            $crate::hub::names_unique(<$hub as $crate::hub::Hub>::METHODS),
            "duplicate method name in hub descriptor"
        );
        const _: () = assert!(
            $crate::hub::names_unique(<$hub as $crate::hub::Hub>::CALLBACKS),
            "duplicate callback name in hub descriptor"
        );

        $(
            $(#[$m_meta])*
            #[derive(Debug, Clone, Copy, Default)]
            $vis struct $method;

            impl $crate::hub::HubMethod<$hub> for $method {
                const NAME: &'static str = $m_name;
                type Args = ($($m_arg,)*);
                type Output = $m_out;
            }
        )*

        $(
            $(#[$c_meta])*
            #[derive(Debug, Clone, Copy, Default)]
            $vis struct $callback;

            impl $crate::hub::HubCallback<$hub> for $callback {
                const NAME: &'static str = $c_name;
                type Args = ($($c_arg,)*);
            }
        )*
    };
}
