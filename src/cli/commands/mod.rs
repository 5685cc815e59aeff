//! CLI command implementations.

pub mod config;
pub mod dlq;
pub mod pending;
