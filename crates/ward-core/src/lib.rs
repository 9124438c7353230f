//! Foundational low-level utilities shared across Ward crates.
//!
//! Provides time helpers used for registration and audit timestamps, and the
//! identifier normalization used wherever recipient names are compared.

pub mod identifier;
pub mod time_utils;

pub use identifier::{identifiers_match, normalize_identifier};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
