//! SMTP client for outbound delivery.
//!
//! A thin command/response layer over a TCP connection with opportunistic
//! STARTTLS. Policy (which replies are fatal, pooling, retries) belongs to
//! the caller.
//!
//! ```no_run
//! use postern_smtp::{client::SmtpClient, config::ClientTimeouts};
//!
//! # async fn example() -> Result<(), postern_smtp::client::ClientError> {
//! let mut client =
//!     SmtpClient::connect("192.0.2.25:25".parse().unwrap(), "mx.example.com", ClientTimeouts::default())
//!         .await?;
//! client.read_greeting().await?;
//! client.hello("relay.example.org").await?;
//! client.mail_from("<sender@example.org>").await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod response;
mod smtp_client;

pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::SmtpClient;
