//! Infrastructure adapters for the persistence ports.

pub mod memory;
pub mod sqlite;
