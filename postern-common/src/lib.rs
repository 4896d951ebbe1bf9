pub mod code;
pub mod domain;
pub mod error;
pub mod logging;
pub mod status;

pub use tracing;

pub use self::{code::Code, domain::Domain, status::Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
