//! `MAIL FROM:` / `RCPT TO:` argument parsing (RFC 1869 section 6).
//!
//! The result is the address followed by any ESMTP parameters, in the order
//! they appeared:
//!
//! ```
//! use postern_smtp::rfc1869::{Kind, parse};
//!
//! assert_eq!(
//!     parse(Kind::Mail, "FROM:<user@example.com> SIZE=1234", false).unwrap(),
//!     ["<user@example.com>", "SIZE=1234"]
//! );
//! ```

use crate::error::ParseError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Mail,
    Rcpt,
}

impl Kind {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Mail => "from:",
            Self::Rcpt => "to:",
        }
    }

    const fn command(self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Rcpt => "rcpt",
        }
    }
}

/// Split a `MAIL`/`RCPT` argument into the address and its parameters.
///
/// In strict mode the address must be enclosed in angle brackets and follow
/// the colon directly. Otherwise a bare address is wrapped in brackets.
pub fn parse(kind: Kind, line: &str, strict: bool) -> Result<Vec<String>, ParseError> {
    let line = line.trim_end();
    let invalid = || ParseError::InvalidFormat {
        command: kind.command(),
        line: line.to_string(),
    };

    let prefix = kind.prefix();
    let mut rest = line
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &line[prefix.len()..])
        .ok_or_else(invalid)?;

    if !strict {
        rest = rest.trim_start();
    }

    let mut params = Vec::new();
    while let Some(split) = rest.rfind(|c: char| c.is_ascii_whitespace()) {
        let candidate = &rest[split + 1..];
        if !is_parameter(candidate) {
            break;
        }

        params.insert(0, candidate.to_string());
        rest = rest[..split].trim_end();
    }

    let address = if strict { rest } else { rest.trim_start() };

    if strict && !(address.starts_with('<') && address.ends_with('>')) {
        return Err(invalid());
    }

    if address.is_empty() || address == "<>" {
        return match kind {
            Kind::Mail => {
                params.insert(0, "<>".to_string());
                Ok(params)
            }
            Kind::Rcpt => Err(ParseError::MissingRecipient),
        };
    }

    if address.contains(" @") || address.contains("@ ") {
        return Err(ParseError::Address(address.to_string()));
    }

    let bare = address.trim_start_matches('<').trim_end_matches('>');

    if kind == Kind::Rcpt
        && !bare.contains('@')
        && !["postmaster", "abuse"]
            .iter()
            .any(|local| bare.eq_ignore_ascii_case(local))
    {
        return Err(ParseError::Address(address.to_string()));
    }

    params.insert(0, format!("<{bare}>"));
    Ok(params)
}

/// `keyword[=value]`: keyword starts alphanumeric then alphanumerics or `-`;
/// value has no `=`, space or control characters.
fn is_parameter(candidate: &str) -> bool {
    let (keyword, value) = match candidate.split_once('=') {
        Some((keyword, value)) => (keyword, Some(value)),
        None => (candidate, None),
    };

    let mut chars = keyword.chars();
    let keyword_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-');

    let value_ok = value.is_none_or(|value| {
        !value.is_empty() && !value.chars().any(|c| c == '=' || c == ' ' || c.is_ascii_control())
    });

    keyword_ok && value_ok
}

/// Find `keyword` among parsed parameters, case-insensitively.
#[must_use]
pub fn parameter<'a>(params: &'a [String], keyword: &str) -> Option<&'a str> {
    params.iter().find_map(|param| {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        key.eq_ignore_ascii_case(keyword).then_some(value)
    })
}
