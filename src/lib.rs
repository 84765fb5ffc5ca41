//! Hivegate - Distributed Request Rate Limiting
//!
//! This crate decides, per inbound request, whether a caller may proceed. It
//! combines sliding-window ceilings with a token bucket, keeps the counters
//! in a shared store so every server process enforces the same limits, and
//! falls back to process-local limiting whenever the store is unreachable.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod ratelimit;
pub mod response;
pub mod store;
