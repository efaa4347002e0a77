//! CLI command implementations.

pub mod query;
pub mod status;
pub mod watch;
