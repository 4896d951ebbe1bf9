use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Named junctures at which plugins are consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    Connect,
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    RcptOk,
    Data,
    DataPost,
    Queue,
    QueueOutbound,
    ResetTransaction,
    Vrfy,
    Noop,
    Rset,
    Quit,
    Disconnect,
    UnrecognizedCommand,
    MaxDataExceeded,
    Deny,
    Limit,
    Delivered,
    Deferred,
    Bounce,
}

impl Hook {
    pub const ALL: [Self; 23] = [
        Self::Connect,
        Self::Helo,
        Self::Ehlo,
        Self::Mail,
        Self::Rcpt,
        Self::RcptOk,
        Self::Data,
        Self::DataPost,
        Self::Queue,
        Self::QueueOutbound,
        Self::ResetTransaction,
        Self::Vrfy,
        Self::Noop,
        Self::Rset,
        Self::Quit,
        Self::Disconnect,
        Self::UnrecognizedCommand,
        Self::MaxDataExceeded,
        Self::Deny,
        Self::Limit,
        Self::Delivered,
        Self::Deferred,
        Self::Bounce,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::Ehlo => "ehlo",
            Self::Mail => "mail",
            Self::Rcpt => "rcpt",
            Self::RcptOk => "rcpt_ok",
            Self::Data => "data",
            Self::DataPost => "data_post",
            Self::Queue => "queue",
            Self::QueueOutbound => "queue_outbound",
            Self::ResetTransaction => "reset_transaction",
            Self::Vrfy => "vrfy",
            Self::Noop => "noop",
            Self::Rset => "rset",
            Self::Quit => "quit",
            Self::Disconnect => "disconnect",
            Self::UnrecognizedCommand => "unrecognized_command",
            Self::MaxDataExceeded => "max_data_exceeded",
            Self::Deny => "deny",
            Self::Limit => "limit",
            Self::Delivered => "delivered",
            Self::Deferred => "deferred",
            Self::Bounce => "bounce",
        }
    }
}

impl Display for Hook {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hook {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|hook| hook.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PluginError::UnknownHook(s.to_string()))
    }
}
