//! Result codes shared by the hook dispatcher and every `*_respond` handler.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The answer a plugin gives for a single hook invocation.
///
/// `Cont` means "no opinion" and moves the dispatcher on to the next plugin,
/// every other variant ends the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    #[default]
    Cont,
    Ok,
    Deny,
    DenySoft,
    DenyDisconnect,
    DenySoftDisconnect,
    /// Outbound only: postpone the work item without counting a failure.
    Delay,
    /// Outbound only: refuse the work item.
    No,
    /// Outbound only: the plugin could not reach a decision.
    Error,
}

impl Code {
    /// Anything other than `Cont` stops the chain.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Cont)
    }

    /// The four deny variants, which are routed through the `deny` hook
    /// before reaching their response handler.
    #[must_use]
    pub const fn is_deny(self) -> bool {
        matches!(
            self,
            Self::Deny | Self::DenySoft | Self::DenyDisconnect | Self::DenySoftDisconnect
        )
    }

    /// Deny variants that end the session once the response has been written.
    #[must_use]
    pub const fn disconnects(self) -> bool {
        matches!(self, Self::DenyDisconnect | Self::DenySoftDisconnect)
    }

    /// Deny variants that invite the client to retry later.
    #[must_use]
    pub const fn is_soft(self) -> bool {
        matches!(self, Self::DenySoft | Self::DenySoftDisconnect)
    }
}

impl Display for Code {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Cont => "CONT",
            Self::Ok => "OK",
            Self::Deny => "DENY",
            Self::DenySoft => "DENYSOFT",
            Self::DenyDisconnect => "DENYDISCONNECT",
            Self::DenySoftDisconnect => "DENYSOFTDISCONNECT",
            Self::Delay => "DELAY",
            Self::No => "NO",
            Self::Error => "ERROR",
        })
    }
}
