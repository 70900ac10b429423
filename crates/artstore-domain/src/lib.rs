#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod digest;
pub mod entry;
pub mod error;
pub mod uri;

pub use digest::{
    b64_to_hex, b64_to_hex_id, hex_to_b64_id, md5_b64, md5_file_b64, md5_hex, md5_string,
    strip_etag_quotes, ManifestDigester, StreamingMd5, MANIFEST_DIGEST_PREAMBLE,
};
pub use entry::{basename, join_entry_path, normalize_entry_path, Entry};
pub use error::{codes, ArtifactError};
pub use uri::{
    scheme_of, ReferenceUri, SCHEME_ARTIFACT, SCHEME_CLIENT_ARTIFACT, SCHEME_FILE, SCHEME_GCS,
    SCHEME_HTTP, SCHEME_HTTPS, SCHEME_S3,
};
