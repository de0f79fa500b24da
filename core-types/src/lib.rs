//! Shared leaf types, service status handles, and retry policy for the
//! speed logger.

pub mod retry;
pub mod status;
pub mod types;
