#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod core;

pub use artstore_domain::{ArtifactError, Entry, ReferenceUri};

pub use crate::core::artifact::{
    Artifact, ArtifactOptions, ClientArtifactRegistry, UploadSummary, WORKER_THREADS,
};
pub use crate::core::backend::{ArtifactRef, BackendApi, CreatedFile, FileSpec, RemoteArtifact};
pub use crate::core::batcher::{PrepareHandle, PrepareResponse, UploadBatcher};
pub use crate::core::cache::{CacheSlot, CacheWriter, ContentCache};
pub use crate::core::config::{
    BatchSettings, CacheLocation, Config, ManifestBacking, PolicyConfig, StorageLayout,
    TransferSettings, DEFAULT_BASE_URL, DEFAULT_STORAGE_REGION, STORAGE_POLICY_NAME,
};
pub use crate::core::handlers::{
    ArtifactRefHandler, ClientArtifactHandler, GcsHandler, Handler, HttpHandler, LoadOutcome,
    LocalHandler, MultiHandler, ObjectMeta, ObjectStoreClient, S3Handler, StorageHandler,
    StoreRequest, TrackingHandler, DEFAULT_MAX_OBJECTS,
};
pub use crate::core::manifest::{EntriesUnder, FinalizedManifest, Manifest, MANIFEST_VERSION};
pub use crate::core::policy::{StoragePolicy, StoreOutcome};
pub use crate::core::tooling::init_tracing;
