//! Configuration for inbound sessions and the outbound client.
//!
//! Every field has a default, so a configuration file only needs to name
//! what it changes:
//!
//! ```ron
//! smtp: (
//!     databytes: 10485760,
//!     early_talker_delay_ms: 1000,
//!     deny_includes_uuid: true,
//!     timeouts: ( command_secs: 300 ),
//! )
//! ```

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

/// Certificate and key used for STARTTLS.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Protocol limits and behaviour of inbound sessions.
#[derive(Clone, Debug, Deserialize)]
pub struct SmtpConfig {
    /// Largest accepted message in bytes; 0 disables the limit.
    #[serde(default = "defaults::databytes")]
    pub databytes: u64,

    /// How long a client that talks before the greeting is made to wait.
    #[serde(default = "defaults::early_talker_delay_ms")]
    pub early_talker_delay_ms: u64,

    /// Append the transaction id to every 4xx/5xx reply.
    #[serde(default)]
    pub deny_includes_uuid: bool,

    /// Require `<...>` around addresses and no space after `FROM:`/`TO:`.
    #[serde(default)]
    pub strict_rfc1869: bool,

    /// Longest command line, terminator included.
    #[serde(default = "defaults::max_line_length")]
    pub max_line_length: usize,

    /// Longest single line of message data, terminator included.
    #[serde(default = "defaults::max_data_line_length")]
    pub max_data_line_length: usize,

    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            databytes: defaults::databytes(),
            early_talker_delay_ms: defaults::early_talker_delay_ms(),
            deny_includes_uuid: false,
            strict_rfc1869: false,
            max_line_length: defaults::max_line_length(),
            max_data_line_length: defaults::max_data_line_length(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

impl SmtpConfig {
    #[must_use]
    pub const fn early_talker_delay(&self) -> Duration {
        Duration::from_millis(self.early_talker_delay_ms)
    }
}

/// Server-side timeouts, following RFC 5321 section 4.5.3.2.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerTimeouts {
    /// Waiting for the next command.
    #[serde(default = "defaults::command_secs")]
    pub command_secs: u64,

    /// Waiting for each line of message data.
    #[serde(default = "defaults::data_block_secs")]
    pub data_block_secs: u64,

    /// Maximum total connection lifetime.
    #[serde(default = "defaults::connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::command_secs(),
            data_block_secs: defaults::data_block_secs(),
            connection_secs: defaults::connection_secs(),
        }
    }
}

/// Client-side timeouts used when delivering to remote MTAs.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ClientTimeouts {
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Any single command and its reply.
    #[serde(default = "defaults::client_command_secs")]
    pub command_secs: u64,

    /// Sending the body and reading the reply to the final dot.
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            command_secs: defaults::client_command_secs(),
            data_secs: defaults::client_data_secs(),
        }
    }
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }
}

mod defaults {
    pub const fn databytes() -> u64 {
        25 * 1024 * 1024
    }

    pub const fn early_talker_delay_ms() -> u64 {
        1000
    }

    /// RFC 5321 section 4.5.3.1.4.
    pub const fn max_line_length() -> usize {
        512
    }

    pub const fn max_data_line_length() -> usize {
        1024 * 1024
    }

    pub const fn command_secs() -> u64 {
        300
    }

    pub const fn data_block_secs() -> u64 {
        180
    }

    pub const fn connection_secs() -> u64 {
        1800
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }

    pub const fn client_command_secs() -> u64 {
        60
    }

    pub const fn client_data_secs() -> u64 {
        600
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let config: SmtpConfig = ron::from_str("()").unwrap();

        assert_eq!(config.databytes, 25 * 1024 * 1024);
        assert_eq!(config.early_talker_delay(), Duration::from_secs(1));
        assert!(!config.deny_includes_uuid);
        assert_eq!(config.max_line_length, 512);
        assert_eq!(config.max_data_line_length, 1024 * 1024);
        assert_eq!(config.timeouts, ServerTimeouts::default());
    }

    #[test]
    fn partial_timeouts() {
        let config: SmtpConfig =
            ron::from_str("(databytes: 0, timeouts: (command_secs: 5))").unwrap();

        assert_eq!(config.databytes, 0);
        assert_eq!(config.timeouts.command_secs, 5);
        assert_eq!(config.timeouts.data_block_secs, 180);
    }

    #[test]
    fn line_limits_are_configurable() {
        let config: SmtpConfig =
            ron::from_str("(max_line_length: 1000, max_data_line_length: 998)").unwrap();

        assert_eq!(config.max_line_length, 1000);
        assert_eq!(config.max_data_line_length, 998);
    }
}
