//! Pluggable policy hooks.
//!
//! Plugins are values implementing [`Plugin`], registered once at startup into
//! a [`HookRegistry`]. A [`Dispatcher`] runs the plugins registered for a hook
//! one at a time, in registration order, until one of them gives a terminal
//! [`Code`](postern_common::Code).

pub mod dispatcher;
pub mod error;
pub mod hook;
pub mod modules;
pub mod notes;
pub mod plugin;
pub mod registry;
pub mod reply;

pub use dispatcher::{Dispatcher, HookState, Outcome};
pub use error::{DispatchError, PluginError};
pub use hook::Hook;
pub use notes::Notes;
pub use plugin::{ConnectionView, HookArgs, MailItemView, Plugin, Subject, TransactionView};
pub use registry::{HookRegistry, PluginConfig};
pub use reply::{Reply, Verdict};
