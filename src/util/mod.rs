//! Small helpers shared across the engine and the caches.

pub mod bytes;
pub mod lock;
