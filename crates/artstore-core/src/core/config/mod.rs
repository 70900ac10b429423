//! Environment-driven configuration for the store, cache and transfers.

mod paths;
pub mod settings;

pub use paths::CacheLocation;
pub(crate) use paths::resolve_cache_location;
pub use settings::*;
