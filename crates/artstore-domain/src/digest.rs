//! Content digests shared by entries, manifests and the cache.
//!
//! Stored files are identified by the base64 encoding of their MD5 (the form
//! object stores report as `Content-MD5`); object-store references use the
//! backend ETag instead. Manifest digests are hex MD5 over a versioned
//! preamble followed by one `"{path}:{digest}\n"` line per entry.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use md5::{Digest, Md5};

pub const MANIFEST_DIGEST_PREAMBLE: &[u8] = b"wandb-artifact-manifest-v1\n";

const READ_CHUNK: usize = 64 * 1024;

/// Base64 MD5 of an in-memory buffer.
#[must_use]
pub fn md5_b64(bytes: &[u8]) -> String {
    BASE64_STANDARD.encode(Md5::digest(bytes))
}

/// Base64 MD5 of a string's UTF-8 bytes.
#[must_use]
pub fn md5_string(value: &str) -> String {
    md5_b64(value.as_bytes())
}

/// Hex MD5 of a string's UTF-8 bytes.
#[must_use]
pub fn md5_hex(value: &str) -> String {
    hex::encode(Md5::digest(value.as_bytes()))
}

/// Stream a file through MD5 and return the base64 digest.
pub fn md5_file_b64(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0_u8; READ_CHUNK];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(BASE64_STANDARD.encode(hasher.finalize()))
}

/// Incremental MD5 used while streaming bytes into the cache.
#[derive(Default, Clone)]
pub struct StreamingMd5 {
    inner: Md5,
}

impl StreamingMd5 {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    #[must_use]
    pub fn finish_b64(self) -> String {
        BASE64_STANDARD.encode(self.inner.finalize())
    }
}

/// Convert a base64 digest to lowercase hex.
pub fn b64_to_hex(digest: &str) -> Result<String> {
    let raw = BASE64_STANDARD
        .decode(digest)
        .with_context(|| format!("digest {digest} is not valid base64"))?;
    Ok(hex::encode(raw))
}

/// Artifact ids travel as base64 in the control plane and as hex in
/// reference URIs.
pub fn hex_to_b64_id(hex_id: &str) -> Result<String> {
    let raw = hex::decode(hex_id).with_context(|| format!("artifact id {hex_id} is not hex"))?;
    Ok(BASE64_STANDARD.encode(raw))
}

pub fn b64_to_hex_id(b64_id: &str) -> Result<String> {
    b64_to_hex(b64_id)
}

/// Strip the surrounding double quotes object stores put around ETags.
#[must_use]
pub fn strip_etag_quotes(etag: &str) -> &str {
    etag.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(etag)
}

/// Accumulates the manifest digest. Callers must feed entries in path order.
pub struct ManifestDigester {
    hasher: Md5,
}

impl ManifestDigester {
    #[must_use]
    pub fn new() -> Self {
        let mut hasher = Md5::new();
        hasher.update(MANIFEST_DIGEST_PREAMBLE);
        Self { hasher }
    }

    pub fn push(&mut self, path: &str, digest: &str) {
        self.hasher.update(format!("{path}:{digest}\n").as_bytes());
    }

    #[must_use]
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Default for ManifestDigester {
    fn default() -> Self {
        Self::new()
    }
}
