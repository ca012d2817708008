//! Formatting helpers for listings.

pub mod format;

pub use format::{format_optional, format_timestamp, truncate_string};
