pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handoff;
pub mod line_source;
pub mod listener;
pub mod rfc1869;
pub mod session;
pub mod transaction;

pub use config::{ClientTimeouts, ServerTimeouts, SmtpConfig, TlsContext};
pub use handoff::{Envelope, HandoffError, QueueHandoff};
pub use line_source::LineSource;
pub use listener::{Listener, ListenerConfig};
pub use session::{Session, SessionConfig, SessionConfigBuilder, State};
pub use transaction::{Header, Transaction};
