//! Per-scheme strategies for turning a source URI into manifest entries and
//! a manifest entry back into readable content.

mod artifact_ref;
mod client_artifact;
mod gcs;
mod http;
mod local;
pub mod object_store;
mod s3;
mod tracking;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use tracing::debug;

use artstore_domain::{scheme_of, ArtifactError, Entry};

pub use artifact_ref::ArtifactRefHandler;
pub use client_artifact::ClientArtifactHandler;
pub use gcs::GcsHandler;
pub use http::HttpHandler;
pub use local::LocalHandler;
pub use object_store::{ObjectMeta, ObjectStoreClient};
pub use s3::S3Handler;
pub use tracking::TrackingHandler;

/// Cap on objects enumerated by one directory or prefix reference.
pub const DEFAULT_MAX_OBJECTS: usize = 10_000;

/// Arguments of [`StorageHandler::store_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub uri: String,
    pub name: Option<String>,
    pub checksum: bool,
    pub max_objects: usize,
}

impl StoreRequest {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            checksum: true,
            max_objects: DEFAULT_MAX_OBJECTS,
        }
    }

    #[must_use]
    pub fn name(mut self, name: Option<impl Into<String>>) -> Self {
        self.name = name.map(Into::into);
        self
    }

    #[must_use]
    pub fn checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// `None` keeps [`DEFAULT_MAX_OBJECTS`].
    #[must_use]
    pub fn max_objects(mut self, max_objects: Option<usize>) -> Self {
        self.max_objects = max_objects.unwrap_or(DEFAULT_MAX_OBJECTS);
        self
    }
}

/// Where the content of an entry can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Verified copy inside the content cache.
    Local(PathBuf),
    /// Remote location the caller streams from directly.
    Remote(String),
    /// The content is `entry` of another artifact owned by `entity`; the
    /// storage policy finishes the load.
    Delegate { entity: String, entry: Entry },
}

pub trait StorageHandler {
    fn scheme(&self) -> &str;

    /// Entries for the content at `request.uri`, at most
    /// `request.max_objects` of them.
    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>>;

    /// Resolve `entry`; with `local` the content is verified against
    /// `entry.digest` and placed in the cache.
    fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome>;
}

/// The closed set of handlers.
pub enum Handler {
    Local(LocalHandler),
    S3(S3Handler),
    Gcs(GcsHandler),
    Http(HttpHandler),
    ArtifactRef(ArtifactRefHandler),
    ClientArtifact(ClientArtifactHandler),
    Tracking(TrackingHandler),
}

impl Handler {
    fn as_dyn(&self) -> &dyn StorageHandler {
        match self {
            Self::Local(handler) => handler,
            Self::S3(handler) => handler,
            Self::Gcs(handler) => handler,
            Self::Http(handler) => handler,
            Self::ArtifactRef(handler) => handler,
            Self::ClientArtifact(handler) => handler,
            Self::Tracking(handler) => handler,
        }
    }
}

impl StorageHandler for Handler {
    fn scheme(&self) -> &str {
        self.as_dyn().scheme()
    }

    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        self.as_dyn().store_path(request)
    }

    fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        self.as_dyn().load_path(entry, local)
    }
}

/// Dispatches on the URI scheme; unknown schemes go to the tracking
/// fallback when one is installed.
pub struct MultiHandler {
    handlers: BTreeMap<String, Handler>,
    fallback: Option<TrackingHandler>,
}

impl Default for MultiHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiHandler {
    /// No scheme handlers, tracking fallback installed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            fallback: Some(TrackingHandler::new()),
        }
    }

    /// Register `handler` under its own scheme, replacing any previous one.
    #[must_use]
    pub fn with(mut self, handler: Handler) -> Self {
        self.handlers.insert(handler.scheme().to_string(), handler);
        self
    }

    /// Unknown schemes fail with [`ArtifactError::UnsupportedScheme`].
    #[must_use]
    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    #[must_use]
    pub fn schemes(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    fn resolve(&self, uri: &str) -> Result<&dyn StorageHandler> {
        let scheme = scheme_of(uri).unwrap_or_default();
        if let Some(handler) = self.handlers.get(scheme) {
            return Ok(handler);
        }
        match &self.fallback {
            Some(fallback) => {
                debug!(%uri, scheme, "no handler for scheme; tracking reference");
                Ok(fallback)
            }
            None => Err(ArtifactError::UnsupportedScheme {
                scheme: scheme.to_string(),
            }
            .into()),
        }
    }

    pub fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        self.resolve(&request.uri)?.store_path(request)
    }

    pub fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        let target = entry.reference.as_deref().ok_or_else(|| {
            ArtifactError::UnresolvedReference {
                uri: entry.path.clone(),
                reason: "entry is not a reference".into(),
            }
        })?;
        self.resolve(target)?.load_path(entry, local)
    }
}
