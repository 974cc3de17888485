//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod fetcher;
pub mod memory;
pub mod net_guard;
pub mod telemetry;
