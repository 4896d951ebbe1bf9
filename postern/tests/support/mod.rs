//! A running postern on loopback, plus a sink MTA for it to relay to.

pub mod sink;
