//! Logging macros and subscriber setup.
//!
//! Every event is emitted inside a span naming its direction: `incoming`
//! for lines read from a peer, `outgoing` for replies written to one and
//! `internal` for everything else. Structured fields go in braces ahead of
//! the message, which is how sessions attach their connection id and
//! deliveries their queue file name:
//!
//! ```ignore
//! internal!(level = INFO, { session = %id, peer = %peer }, "Connected");
//! outgoing!({ session = %id }, "{reply}");
//! ```

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Only events from these crates reach the output.
const TARGET_PREFIX: &str = "postern";

#[macro_export]
macro_rules! log {
    ($level:expr, $direction:literal, { $($field:tt)+ }, $($msg:tt)+) => {{
        let span = $crate::tracing::span!($level, $direction);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($field)+, $($msg)+)
    }};

    ($level:expr, $direction:literal, $($msg:tt)+) => {{
        let span = $crate::tracing::span!($level, $direction);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)+)
    }};
}

/// Responses written to a peer
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, { $($field:tt)+ }, $($msg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", { $($field)+ }, $($msg)+)
    };

    (level = $level:ident, $($msg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)+)
    };

    ({ $($field:tt)+ }, $($msg:tt)+) => {
        $crate::outgoing!(level = TRACE, { $($field)+ }, $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::outgoing!(level = TRACE, $($msg)+)
    };
}

/// Lines read from a peer
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, { $($field:tt)+ }, $($msg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", { $($field)+ }, $($msg)+)
    };

    (level = $level:ident, $($msg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg)+)
    };

    ({ $($field:tt)+ }, $($msg:tt)+) => {
        $crate::incoming!(level = TRACE, { $($field)+ }, $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::incoming!(level = TRACE, $($msg)+)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, { $($field:tt)+ }, $($msg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "internal", { $($field)+ }, $($msg)+)
    };

    (level = $level:ident, $($msg:tt)+) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)+)
    };

    ({ $($field:tt)+ }, $($msg:tt)+) => {
        $crate::internal!(level = TRACE, { $($field)+ }, $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::internal!(level = TRACE, $($msg)+)
    };
}

/// Parse a `LOG_LEVEL` value, falling back to `default` when unset or invalid.
fn parse_level(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Install the process-wide subscriber.
///
/// The level comes from `LOG_LEVEL`, else TRACE in debug builds and INFO in
/// release builds. Dependencies such as rustls and hickory stay quiet.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };
    let level = parse_level(std::env::var("LOG_LEVEL").ok().as_deref(), default);

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with(TARGET_PREFIX)
                })),
        )
        .init();
}
