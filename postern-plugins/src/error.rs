use thiserror::Error;

use crate::hook::Hook;

/// Errors a plugin may return from a hook handler.
///
/// Returning an error counts as answering `CONT`: the failure is logged and
/// the chain moves on to the next plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Unknown hook: {0}")]
    UnknownHook(String),

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Misuse of the dispatcher itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A hook was started on an object that is already running one.
    #[error("Cannot run {requested} while {running} is still running")]
    Reentrant { running: Hook, requested: Hook },
}
