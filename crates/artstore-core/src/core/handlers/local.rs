use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use artstore_domain::{
    basename, join_entry_path, md5_file_b64, md5_string, ArtifactError, Entry, ReferenceUri,
    SCHEME_FILE,
};

use super::{LoadOutcome, StorageHandler, StoreRequest};
use crate::core::cache::ContentCache;

/// Bytes kept verbatim in a path segment of a reference URI.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// `file://` references to files and directories on a local or mounted
/// filesystem.
#[derive(Debug, Clone)]
pub struct LocalHandler {
    cache: ContentCache,
}

impl LocalHandler {
    #[must_use]
    pub fn new(cache: ContentCache) -> Self {
        Self { cache }
    }

    /// Content digest, or a digest of the size alone when not checksumming.
    fn digest(path: &Path, size: u64, checksum: bool) -> Result<String> {
        if checksum {
            md5_file_b64(path)
        } else {
            Ok(md5_string(&size.to_string()))
        }
    }

    fn store_dir(
        uri: &ReferenceUri,
        root: &Path,
        request: &StoreRequest,
    ) -> Result<Vec<Entry>> {
        let started = Instant::now();
        if request.checksum {
            info!(
                path = %root.display(),
                max_objects = request.max_objects,
                "generating checksums for files in directory"
            );
        }
        let mut files: Vec<(PathBuf, String)> = Vec::new();
        for item in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let item = item.with_context(|| format!("failed to walk {}", root.display()))?;
            if !item.file_type().is_file() {
                continue;
            }
            if files.len() == request.max_objects {
                return Err(ArtifactError::TooManyObjects {
                    uri: uri.to_string(),
                    max_objects: request.max_objects,
                }
                .into());
            }
            let relative = item
                .path()
                .strip_prefix(root)
                .with_context(|| format!("{} escaped {}", item.path().display(), root.display()))?
                .to_string_lossy()
                .into_owned();
            files.push((item.into_path(), relative));
        }

        let base = uri.as_str().trim_end_matches('/');
        let entries = files
            .par_iter()
            .map(|(physical, relative)| {
                let relative = artstore_domain::normalize_entry_path(relative);
                let size = fs::metadata(physical)
                    .with_context(|| format!("failed to stat {}", physical.display()))?
                    .len();
                let digest = Self::digest(physical, size, request.checksum)?;
                Ok(Entry::reference(
                    join_entry_path(request.name.as_deref(), &relative),
                    format!("{base}/{}", encode_relative(&relative)),
                    digest,
                )
                .with_size(Some(size)))
            })
            .collect::<Result<Vec<_>>>()?;
        if request.checksum {
            info!(
                files = entries.len(),
                elapsed_ms = started.elapsed().as_millis(),
                "directory checksums done"
            );
        }
        Ok(entries)
    }
}

impl StorageHandler for LocalHandler {
    fn scheme(&self) -> &str {
        SCHEME_FILE
    }

    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        let uri = ReferenceUri::parse(&request.uri)?;
        let local = PathBuf::from(uri.local_path());
        if local.is_dir() {
            return Self::store_dir(&uri, &local, request);
        }
        if local.is_file() {
            let size = fs::metadata(&local)
                .with_context(|| format!("failed to stat {}", local.display()))?
                .len();
            let name = request
                .name
                .clone()
                .unwrap_or_else(|| basename(uri.path()).to_string());
            let digest = Self::digest(&local, size, request.checksum)?;
            return Ok(vec![
                Entry::reference(name, uri.as_str(), digest).with_size(Some(size))
            ]);
        }
        Err(ArtifactError::InvalidSource {
            source_path: request.uri.clone(),
            reason: "must be a valid file or directory path".into(),
        }
        .into())
    }

    fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        let target = entry.ref_target().unwrap_or_default();
        if !local {
            return Ok(LoadOutcome::Remote(target.to_string()));
        }
        let source = PathBuf::from(ReferenceUri::parse(target)?.local_path());
        if !source.is_file() {
            return Err(ArtifactError::ObjectNotFound {
                uri: target.to_string(),
                version: None,
            }
            .into());
        }
        let slot = self
            .cache
            .check_md5_obj_path(&entry.digest, entry.cache_size())?;
        if slot.is_hit() {
            return Ok(LoadOutcome::Local(slot.into_path()));
        }
        let actual = md5_file_b64(&source)?;
        if actual != entry.digest {
            return Err(ArtifactError::DigestMismatch {
                target: target.to_string(),
                expected: entry.digest.clone(),
                actual,
            }
            .into());
        }
        debug!(path = %source.display(), "copying local reference into cache");
        Ok(LoadOutcome::Local(slot.fill_from_file(&source)?))
    }
}

/// `a b/c#1` -> `a%20b/c%231`, so names survive URI parsing.
fn encode_relative(relative: &str) -> String {
    relative
        .split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}
