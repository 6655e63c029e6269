//! numberd: outbound-number admission cache for an SMS gateway.
//!
//! Picks which sending number a message should go out on, honouring each
//! number's daily distinct-recipient cap and per-number send pacing.

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod hydrator;
pub mod profile;
pub mod records;
pub mod scheduler;
pub mod selector;
pub mod sync;
pub mod telemetry;
