//! Errors raised by the dynamic action surface and the keyed registry.

use futures::task::SpawnError;
use thiserror::Error;

/// Errors raised by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// No action with this name was declared.
    #[error("no action named `{name}`")]
    UnknownAction {
        /// Requested action name.
        name: String,
    },

    /// The argument passed to an action has the wrong type.
    #[error("action `{name}` expects an argument of type `{expected}`")]
    ArgumentType {
        /// Action name.
        name: String,
        /// Type the action was declared with.
        expected: &'static str,
    },

    /// The caller asked for a different return type than the action produces.
    #[error("action `{name}` does not return `{requested}`")]
    ReturnType {
        /// Action name.
        name: String,
        /// Type the caller asked for.
        requested: &'static str,
    },

    /// A deferred action was invoked synchronously.
    #[error("action `{name}` is deferred, invoke it with `call_async`")]
    Deferred {
        /// Action name.
        name: String,
    },

    /// A synchronous action was invoked with `call_async`.
    #[error("action `{name}` is not deferred, invoke it with `call`")]
    NotDeferred {
        /// Action name.
        name: String,
    },

    /// The executor refused a detached mutation.
    #[error("failed to spawn deferred mutation")]
    Spawn(#[from] SpawnError),

    /// A keyed registry entry holds a store of another holder type.
    #[error("key `{key}` is bound to a different state holder type")]
    KeyType {
        /// Debug rendering of the key.
        key: String,
    },
}

/// Result alias defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
