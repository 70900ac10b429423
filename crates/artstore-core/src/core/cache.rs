//! Content-addressed local cache.
//!
//! Objects live under `obj/md5/{hex[..2]}/{hex[2..]}` (stored files, keyed by
//! the MD5 of their bytes) or `obj/etag/{h[..2]}/{h[2..]}` (object-store and
//! HTTP references, keyed by a hash of the backend ETag). Writers stage bytes
//! in `tmp/` and rename into place, so a key never exposes a partial file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::debug;

use artstore_domain::{b64_to_hex, md5_hex, ArtifactError, StreamingMd5};

#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join("obj"), root.join("tmp")] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slot for a stored file addressed by its base64 MD5 and size.
    pub fn check_md5_obj_path(&self, b64_md5: &str, size: u64) -> Result<CacheSlot> {
        let hex = b64_to_hex(b64_md5)?;
        Ok(self.slot(self.sharded("md5", &hex), size, "md5", b64_md5))
    }

    /// Slot for referenced content addressed by its ETag and size.
    #[must_use]
    pub fn check_etag_obj_path(&self, etag: &str, size: u64) -> CacheSlot {
        let hashed = md5_hex(etag);
        self.slot(self.sharded("etag", &hashed), size, "etag", etag)
    }

    fn sharded(&self, kind: &str, hex: &str) -> PathBuf {
        let (shard, rest) = hex.split_at(hex.len().min(2));
        self.root.join("obj").join(kind).join(shard).join(rest)
    }

    fn slot(&self, path: PathBuf, size: u64, kind: &'static str, key: &str) -> CacheSlot {
        let hit = fs::metadata(&path).is_ok_and(|meta| meta.is_file() && meta.len() == size);
        debug!(kind, %key, size, hit, "cache lookup");
        CacheSlot {
            path,
            hit,
            tmp_dir: self.root.join("tmp"),
        }
    }
}

/// Result of a cache lookup: where the object lives and whether it is
/// already complete there.
#[derive(Debug, Clone)]
pub struct CacheSlot {
    path: PathBuf,
    hit: bool,
    tmp_dir: PathBuf,
}

impl CacheSlot {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_hit(&self) -> bool {
        self.hit
    }

    #[must_use]
    pub fn into_path(self) -> PathBuf {
        self.path
    }

    /// Scoped writer that publishes to this slot on [`CacheWriter::commit`].
    pub fn writer(&self) -> Result<CacheWriter> {
        fs::create_dir_all(&self.tmp_dir).with_context(|| {
            format!("failed to create cache staging dir {}", self.tmp_dir.display())
        })?;
        let tmp = NamedTempFile::new_in(&self.tmp_dir).with_context(|| {
            format!("failed to create staging file in {}", self.tmp_dir.display())
        })?;
        Ok(CacheWriter {
            tmp,
            dest: self.path.clone(),
            hasher: StreamingMd5::new(),
            expected_md5: None,
            label: None,
        })
    }

    /// Copy `source` into the slot unless it is already a hit.
    pub fn fill_from_file(&self, source: &Path) -> Result<PathBuf> {
        if self.hit {
            return Ok(self.path.clone());
        }
        let mut reader = File::open(source)
            .with_context(|| format!("failed to open {}", source.display()))?;
        let mut writer = self.writer()?;
        io::copy(&mut reader, &mut writer)
            .with_context(|| format!("failed to copy {} into cache", source.display()))?;
        writer.commit()
    }
}

/// Temporary file that becomes visible under its cache key only on commit.
/// Dropping it without committing discards the bytes.
pub struct CacheWriter {
    tmp: NamedTempFile,
    dest: PathBuf,
    hasher: StreamingMd5,
    expected_md5: Option<String>,
    label: Option<String>,
}

impl CacheWriter {
    /// Require the written bytes to hash to `b64_md5`; `label` names the
    /// source in the mismatch error.
    #[must_use]
    pub fn verify_md5(mut self, b64_md5: impl Into<String>, label: impl Into<String>) -> Self {
        self.expected_md5 = Some(b64_md5.into());
        self.label = Some(label.into());
        self
    }

    pub fn commit(mut self) -> Result<PathBuf> {
        self.tmp
            .flush()
            .with_context(|| format!("failed to flush staging file for {}", self.dest.display()))?;
        if let Some(expected) = self.expected_md5.take() {
            let actual = self.hasher.clone().finish_b64();
            if actual != expected {
                return Err(ArtifactError::DigestMismatch {
                    target: self.label.take().unwrap_or_else(|| self.dest.display().to_string()),
                    expected,
                    actual,
                }
                .into());
            }
        }
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        }
        let dest = self.dest;
        self.tmp
            .persist(&dest)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to publish cache object {}", dest.display()))?;
        debug!(path = %dest.display(), "cache object published");
        Ok(dest)
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tmp.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.flush()
    }
}
