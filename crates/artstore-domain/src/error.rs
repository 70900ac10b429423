/// Diagnostic codes attached to every [`ArtifactError`].
pub mod codes {
    pub const PATH_CONFLICT: &str = "ART101";
    pub const FINALIZED: &str = "ART102";
    pub const INVALID_NAME: &str = "ART103";
    pub const DIGEST_MISMATCH: &str = "ART201";
    pub const OBJECT_NOT_FOUND: &str = "ART202";
    pub const TOO_MANY_OBJECTS: &str = "ART301";
    pub const UNRESOLVED_REFERENCE: &str = "ART302";
    pub const UNSUPPORTED_SCHEME: &str = "ART303";
    pub const INVALID_SOURCE: &str = "ART304";
    pub const VERSIONING_DISABLED: &str = "ART305";
    pub const BACKEND_UNAVAILABLE: &str = "ART401";
    pub const UPLOAD_FAILED: &str = "ART402";
    pub const BACKEND_RESPONSE: &str = "ART403";
    pub const UNSUPPORTED_ENGINE: &str = "ART501";
}

/// Errors surfaced by the artifact store.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum ArtifactError {
    #[error("[ART101] cannot add the same path twice: {path} (existing digest {existing}, new digest {attempted})")]
    PathConflict {
        path: String,
        existing: String,
        attempted: String,
    },
    #[error("[ART102] artifact {name} is finalized; no further entries can be added")]
    Finalized { name: String },
    #[error("[ART103] invalid artifact name \"{name}\": only alphanumerics, dashes, underscores and dots are allowed")]
    InvalidName { name: String },
    #[error("[ART201] digest mismatch for {target}: expected {expected} but found {actual}")]
    DigestMismatch {
        target: String,
        expected: String,
        actual: String,
    },
    #[error("[ART202] object {uri} not found{}", version_suffix(.version))]
    ObjectNotFound {
        uri: String,
        version: Option<String>,
    },
    #[error("[ART301] exceeded {max_objects} objects tracked under {uri}; pass a larger max_objects")]
    TooManyObjects { uri: String, max_objects: usize },
    #[error("[ART302] unresolved reference {uri}: {reason}")]
    UnresolvedReference { uri: String, reason: String },
    #[error("[ART303] no storage handler registered for scheme \"{scheme}\"")]
    UnsupportedScheme { scheme: String },
    #[error("[ART304] invalid source {source_path}: {reason}")]
    InvalidSource { source_path: String, reason: String },
    #[error("[ART304] a name is required when tracking references with unrecognized schemes: {uri}")]
    MissingName { uri: String },
    #[error("[ART305] a version was specified for {uri} but bucket {bucket} does not have versioning enabled")]
    VersioningDisabled { uri: String, bucket: String },
    #[error("[ART401] backend unavailable at {url} after {attempts} attempt(s): {detail}")]
    BackendUnavailable {
        url: String,
        attempts: usize,
        detail: String,
    },
    #[error("[ART402] upload to {url} failed with status {status}")]
    UploadFailed { url: String, status: u16 },
    #[error("[ART403] malformed backend response: {detail}")]
    BackendResponse { detail: String },
    #[error("[ART501] manifest store requires sqlite >= {required}, found {found}")]
    UnsupportedEngineVersion { required: String, found: String },
}

fn version_suffix(version: &Option<String>) -> String {
    version
        .as_deref()
        .map(|v| format!(" (version {v})"))
        .unwrap_or_default()
}

impl ArtifactError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathConflict { .. } => codes::PATH_CONFLICT,
            Self::Finalized { .. } => codes::FINALIZED,
            Self::InvalidName { .. } => codes::INVALID_NAME,
            Self::DigestMismatch { .. } => codes::DIGEST_MISMATCH,
            Self::ObjectNotFound { .. } => codes::OBJECT_NOT_FOUND,
            Self::TooManyObjects { .. } => codes::TOO_MANY_OBJECTS,
            Self::UnresolvedReference { .. } => codes::UNRESOLVED_REFERENCE,
            Self::UnsupportedScheme { .. } => codes::UNSUPPORTED_SCHEME,
            Self::InvalidSource { .. } | Self::MissingName { .. } => codes::INVALID_SOURCE,
            Self::VersioningDisabled { .. } => codes::VERSIONING_DISABLED,
            Self::BackendUnavailable { .. } => codes::BACKEND_UNAVAILABLE,
            Self::UploadFailed { .. } => codes::UPLOAD_FAILED,
            Self::BackendResponse { .. } => codes::BACKEND_RESPONSE,
            Self::UnsupportedEngineVersion { .. } => codes::UNSUPPORTED_ENGINE,
        }
    }

    /// Transient failures are retried by the transfer layer; everything else
    /// is fatal to the operation that raised it.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}
