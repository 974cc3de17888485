//! Rendering execution engine for feed cards.
//!
//! Drawing jobs enter through [`render::RenderEngine`], which bounds how many
//! run at once, how many may wait, and how long each may take. Every native
//! handle a job creates is tracked by its [`render::DrawingSession`] and
//! released when the job ends, however it ends. Source assets and finished
//! artifacts live in the disk caches under [`cache`].

pub mod cache;
pub mod config;
pub mod error;
pub mod graphics;
pub mod infra;
pub mod render;
pub mod util;
