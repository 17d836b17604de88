//! Utility functions for display formatting.

pub mod format;

pub use format::{format_bytes, format_credits, format_date, truncate_string};
