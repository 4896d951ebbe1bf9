pub mod config;
pub mod error;
pub mod lines;
pub mod message;
pub mod queue_file;

pub use config::SpoolConfig;
pub use error::{QueueFileError, Result, SpoolError};
pub use lines::{DeliverOptions, LineEnding, trim_terminator};
pub use message::{BoundarySpan, MessageSpool};
pub use queue_file::{QueueFile, QueueFileName, Todo};
