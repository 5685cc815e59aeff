pub mod runtime;

pub use runtime::{EventRuntime, EventRuntimeBuilder, InitReport, RuntimeSnapshot};
