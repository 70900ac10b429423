//! Internal implementation modules for `artstore-core`.
//!
//! Callers go through the re-exports at the crate root.

pub mod artifact;
pub mod backend;
pub mod batcher;
pub mod cache;
pub mod config;
pub mod handlers;
pub mod manifest;
pub(crate) mod net;
pub mod policy;
#[cfg(test)]
mod testing;
pub mod tooling;
