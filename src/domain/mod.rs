//! Domain layer for the Bulwark event runtime
//!
//! This module contains the core models, error taxonomy and port traits.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{ErrorCode, RuntimeError, RuntimeResult, StoreError, StoreResult};
