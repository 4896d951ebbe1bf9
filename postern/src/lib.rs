//! Process wiring for the postern SMTP server.
//!
//! [`Postern`](controller::Postern) owns the configuration, starts a
//! [`Listener`](postern_smtp::Listener) per configured socket and the
//! outbound [`Outbound`](postern_delivery::Outbound) scheduler, and stops
//! them together on SIGINT or SIGTERM.

pub mod config;
pub mod controller;

pub use config::Config;
pub use controller::{Postern, Running};
