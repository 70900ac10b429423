//! The user-facing aggregate: one manifest, a shared storage policy and a
//! scoped staging directory.

mod registry;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

use artstore_domain::{
    b64_to_hex, basename, join_entry_path, md5_file_b64, normalize_entry_path, scheme_of,
    ArtifactError, Entry,
};

use crate::core::batcher::UploadBatcher;
use crate::core::config::ManifestBacking;
use crate::core::handlers::StoreRequest;
use crate::core::manifest::{lock, FinalizedManifest, Manifest};
use crate::core::policy::StoragePolicy;

pub use registry::ClientArtifactRegistry;

/// Width of the pools hashing directory files and uploading entries.
pub const WORKER_THREADS: usize = 8;

/// Names under this prefix are staged under content-derived names.
const TMP_NAME_PREFIX: &str = "media/tables";

/// Hex characters of the digest that replace a temporary name's stem.
const TMP_STEM_LEN: usize = 20;

/// Optional parts of a new artifact.
#[derive(Debug, Clone, Default)]
pub struct ArtifactOptions {
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
    pub backing: ManifestBacking,
}

impl ArtifactOptions {
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn backing(mut self, backing: ManifestBacking) -> Self {
        self.backing = backing;
        self
    }
}

/// Counts reported by [`Artifact::upload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub deduplicated: usize,
}

pub struct Artifact {
    name: String,
    artifact_type: String,
    description: Option<String>,
    metadata: Map<String, Value>,
    client_id: String,
    sequence_client_id: String,
    manifest: Arc<Manifest>,
    policy: Arc<StoragePolicy>,
    registry: ClientArtifactRegistry,
    added_local_paths: Mutex<HashMap<PathBuf, String>>,
    // Dropped last: the manifest database lives inside it.
    scratch: TempDir,
}

impl Artifact {
    /// A new, empty artifact registered as not yet logged.
    pub fn new(
        name: &str,
        artifact_type: &str,
        options: ArtifactOptions,
        policy: Arc<StoragePolicy>,
        registry: ClientArtifactRegistry,
    ) -> Result<Self> {
        validate_name(name)?;
        let scratch = tempfile::Builder::new()
            .prefix("artstore-")
            .tempdir()
            .context("failed to create artifact staging directory")?;
        let manifest = Arc::new(Manifest::with_backing(
            name,
            options.backing,
            scratch.path().join("manifest.db"),
        )?);
        let client_id = generate_id();
        registry.register(&client_id, &manifest)?;
        debug!(
            artifact = name,
            %client_id,
            backing = ?manifest.backing(),
            "artifact created"
        );
        Ok(Self {
            name: name.to_string(),
            artifact_type: artifact_type.to_string(),
            description: options.description,
            metadata: options
                .metadata
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect(),
            client_id,
            sequence_client_id: generate_id(),
            manifest,
            policy,
            registry,
            added_local_paths: Mutex::new(HashMap::new()),
            scratch,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn artifact_type(&self) -> &str {
        &self.artifact_type
    }

    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Id under which `wandb-client-artifact://` references find this
    /// artifact before it is logged.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn sequence_client_id(&self) -> &str {
        &self.sequence_client_id
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Total bytes of the entries added so far.
    pub fn size(&self) -> Result<u64> {
        self.manifest.size()
    }

    pub fn digest(&self) -> Result<String> {
        self.manifest.digest()
    }

    fn ensure_can_add(&self) -> Result<()> {
        if self.manifest.is_finalized()? {
            return Err(ArtifactError::Finalized {
                name: self.name.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Add one local file under `name` (its file name by default).
    ///
    /// With `is_tmp` the stem of the name is replaced by the start of the
    /// content digest, so identical content staged under throwaway names
    /// collapses onto one entry.
    pub fn add_file(&self, local_path: &Path, name: Option<&str>, is_tmp: bool) -> Result<Entry> {
        self.ensure_can_add()?;
        if !local_path.is_file() {
            return Err(invalid_source(local_path, "path is not a file"));
        }
        let mut name = match name {
            Some(name) => normalize_entry_path(name),
            None => basename(&local_path.to_string_lossy()).to_string(),
        };
        let digest = md5_file_b64(local_path)?;
        if is_tmp {
            name = content_named(&name, &digest)?;
        }
        self.add_local_file(&name, local_path, digest)
    }

    fn add_local_file(&self, name: &str, path: &Path, digest: String) -> Result<Entry> {
        let size = path
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let cached = self
            .policy
            .cache()
            .check_md5_obj_path(&digest, size)?
            .fill_from_file(path)?;
        let entry = Entry::staged(name, digest, cached, size);
        self.manifest.add_entry(&entry)?;
        lock(&self.added_local_paths)?.insert(path.to_path_buf(), entry.path.clone());
        Ok(entry)
    }

    /// Add every file under `local_path` (following symlinks), named
    /// relative to it under the optional `name` prefix. Returns the number
    /// of files added.
    pub fn add_dir(&self, local_path: &Path, name: Option<&str>) -> Result<usize> {
        self.ensure_can_add()?;
        if !local_path.is_dir() {
            return Err(invalid_source(local_path, "path is not a directory"));
        }
        let started = Instant::now();
        let prefix = name.map(normalize_entry_path);
        let mut files = Vec::new();
        for item in WalkDir::new(local_path).follow_links(true).sort_by_file_name() {
            let item = item.with_context(|| format!("failed to walk {}", local_path.display()))?;
            if !item.file_type().is_file() {
                continue;
            }
            let relative = item
                .path()
                .strip_prefix(local_path)
                .with_context(|| format!("{} escaped its root", item.path().display()))?;
            let logical = join_entry_path(prefix.as_deref(), &relative.to_string_lossy());
            files.push((logical, item.into_path()));
        }

        worker_pool()?.install(|| {
            files
                .par_iter()
                .map(|(logical, physical)| {
                    let digest = md5_file_b64(physical)?;
                    self.add_local_file(logical, physical, digest).map(|_| ())
                })
                .collect::<Result<Vec<()>>>()
        })?;
        info!(
            path = %local_path.display(),
            files = files.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "added directory to artifact"
        );
        Ok(files.len())
    }

    /// Create `name` inside the staging directory, let `write` fill it and
    /// add the result. Fails if `name` was already created.
    pub fn new_file(
        &self,
        name: &str,
        write: impl FnOnce(&mut File) -> Result<()>,
    ) -> Result<Entry> {
        self.ensure_can_add()?;
        let path = self.scratch.path().join("files").join(name.trim_start_matches('/'));
        if path.exists() {
            return Err(invalid_source(&path, &format!("a file named {name} already exists")));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        write(&mut file)?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", path.display()))?;
        drop(file);
        self.add_file(&path, Some(name), false)
    }

    /// Serialize `value` (keys sorted) and add it as `name`. Names under
    /// `media/tables` are content-named and their staging copy removed.
    pub fn add_json(&self, name: &str, value: &Value) -> Result<Entry> {
        self.ensure_can_add()?;
        let name = normalize_entry_path(name);
        if let Some(existing) = self.manifest.get_entry_by_path(&name)? {
            return Ok(existing);
        }
        let bytes = serde_json::to_vec(value).context("failed to encode JSON object")?;
        if !name.starts_with(TMP_NAME_PREFIX) {
            return self.new_file(&name, |file| {
                file.write_all(&bytes)
                    .with_context(|| format!("failed to write {name}"))
            });
        }
        let staged = self.scratch.path().join("tmp").join(&name);
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&staged, &bytes).with_context(|| format!("failed to write {}", staged.display()))?;
        let entry = self.add_file(&staged, Some(&name), true);
        fs::remove_file(&staged)
            .with_context(|| format!("failed to remove {}", staged.display()))?;
        entry
    }

    /// Track external content at `uri`. All resulting entries are inserted
    /// in one manifest transaction.
    pub fn add_reference(
        &self,
        uri: &str,
        name: Option<&str>,
        checksum: bool,
        max_objects: Option<usize>,
    ) -> Result<Vec<Entry>> {
        self.ensure_can_add()?;
        if scheme_of(uri).is_none() {
            return Err(ArtifactError::InvalidSource {
                source_path: uri.to_string(),
                reason: "references must be URIs; use file:// for local paths".into(),
            }
            .into());
        }
        let request = StoreRequest::new(uri)
            .name(name.map(normalize_entry_path))
            .checksum(checksum)
            .max_objects(max_objects);
        let entries = self.policy.store_reference(&request)?;
        self.manifest.transaction(|manifest| {
            for entry in &entries {
                manifest.add_entry(entry)?;
            }
            Ok(())
        })?;
        debug!(%uri, entries = entries.len(), "added reference");
        Ok(entries)
    }

    /// Artifact path under which the file at `local_path` was added.
    pub fn get_added_local_path_name(&self, local_path: &Path) -> Result<Option<String>> {
        Ok(lock(&self.added_local_paths)?.get(local_path).cloned())
    }

    /// Freeze the entry set. Repeated calls return the first result.
    pub fn finalize(&self) -> Result<FinalizedManifest> {
        self.manifest.finalize()
    }

    /// Finalize, then store every stored-file entry through the policy,
    /// recording the birth artifact id the control plane assigns.
    pub fn upload(
        &self,
        artifact_id: &str,
        artifact_manifest_id: &str,
        batcher: &UploadBatcher,
    ) -> Result<UploadSummary> {
        self.finalize()?;
        let files: Vec<Entry> = self
            .manifest
            .entries()
            .filter(|entry| entry.as_ref().map_or(true, |entry| !entry.is_reference()))
            .collect::<Result<_>>()?;
        let started = Instant::now();
        let existed = worker_pool()?.install(|| {
            files
                .into_par_iter()
                .map(|mut entry| {
                    let outcome = self.policy.store_file(
                        artifact_id,
                        artifact_manifest_id,
                        &mut entry,
                        batcher,
                    )?;
                    self.manifest
                        .set_birth_artifact_id(&entry.path, &outcome.birth_artifact_id)?;
                    Ok(outcome.exists)
                })
                .collect::<Result<Vec<bool>>>()
        })?;
        let summary = UploadSummary {
            uploaded: existed.iter().filter(|exists| !**exists).count(),
            deduplicated: existed.iter().filter(|exists| **exists).count(),
        };
        info!(
            artifact = %self.name,
            uploaded = summary.uploaded,
            deduplicated = summary.deduplicated,
            elapsed_ms = started.elapsed().as_millis(),
            "artifact files stored"
        );
        Ok(summary)
    }

    /// The artifact now exists in the control plane; client-artifact
    /// references to it no longer resolve.
    pub fn mark_logged(&self) -> Result<()> {
        self.registry.remove(&self.client_id)?;
        Ok(())
    }

    pub fn manifest_json(&self) -> Result<Value> {
        self.manifest
            .to_json(self.policy.name(), self.policy.config_json()?)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName {
            name: name.to_string(),
        }
        .into())
    }
}

/// 128 random bits as lowercase hex.
fn generate_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// `dir/stem.ext` -> `dir/{digest hex prefix}.ext`.
fn content_named(name: &str, digest: &str) -> Result<String> {
    let hex = b64_to_hex(digest)?;
    let stem = &hex[..hex.len().min(TMP_STEM_LEN)];
    let (dir, file) = match name.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, name),
    };
    let renamed = match file.split_once('.') {
        Some((_, rest)) => format!("{stem}.{rest}"),
        None => stem.to_string(),
    };
    Ok(join_entry_path(dir, &renamed))
}

fn invalid_source(path: &Path, reason: &str) -> anyhow::Error {
    ArtifactError::InvalidSource {
        source_path: path.display().to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn worker_pool() -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(WORKER_THREADS)
        .thread_name(|index| format!("artstore-worker-{index}"))
        .build()
        .context("failed to build artifact worker pool")
}
