//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - Serialized defaults
//! - Project YAML files under `.bulwark/`
//! - `BULWARK_*` environment overrides
//! - Validation of ranges and enumerations

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
