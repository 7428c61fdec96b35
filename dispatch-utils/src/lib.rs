//! Utility library for the testbed dispatcher

pub mod other;
pub mod serde;
