//! The authoritative path -> entry index of one artifact.

mod memory;
mod sqlite;
#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use artstore_domain::{ArtifactError, Entry, ManifestDigester};

use crate::core::config::ManifestBacking;

pub(crate) use memory::MemoryStore;
pub(crate) use sqlite::{engine_supported, SqliteStore, DEFAULT_MAX_BUFFER_SIZE};

pub const MANIFEST_VERSION: u32 = 1;
const PAGE_SIZE: usize = 1_000;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("manifest lock poisoned by a panicking writer"))
}

/// Storage behind a [`Manifest`]. Implementations keep entries unique by
/// path and return them in byte order of the path.
pub(crate) trait ManifestStore: Send + Sync {
    /// Insert or refresh `entry`; a differing digest for an existing path is
    /// a [`ArtifactError::PathConflict`] and leaves the stored row untouched.
    fn upsert(&self, entry: &Entry, buffered: bool) -> Result<()>;
    fn get(&self, path: &str) -> Result<Option<Entry>>;
    /// Up to `limit` entries whose path starts with `prefix`, strictly after
    /// `after` when given.
    fn page(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Entry>>;
    fn set_birth_artifact_id(&self, path: &str, birth_artifact_id: &str) -> Result<bool>;
    fn len(&self) -> Result<usize>;
    fn total_size(&self) -> Result<u64>;
    fn flush(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn location(&self) -> Option<&Path>;
}

/// Digest and on-disk location reported by [`Manifest::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedManifest {
    pub digest: String,
    pub location: Option<PathBuf>,
}

#[derive(Default)]
struct TransactionScope {
    owner: Option<ThreadId>,
    depth: usize,
}

pub struct Manifest {
    name: String,
    backing: ManifestBacking,
    store: Box<dyn ManifestStore>,
    finalized: RwLock<Option<FinalizedManifest>>,
    scope: Mutex<TransactionScope>,
}

impl Manifest {
    /// An in-memory manifest for the artifact called `name`.
    #[must_use]
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::from_store(name.into(), ManifestBacking::Memory, Box::new(MemoryStore::default()))
    }

    /// A SQLite-backed manifest stored at `path`.
    pub fn sqlite(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let store = SqliteStore::open(path.into(), DEFAULT_MAX_BUFFER_SIZE)?;
        Ok(Self::from_store(name.into(), ManifestBacking::Sqlite, Box::new(store)))
    }

    /// Construct the requested backing. `Auto` tries the SQLite engine and
    /// falls back to memory before any entry exists; an explicit `Sqlite`
    /// request on an unsupported engine is an error.
    pub fn with_backing(
        name: impl Into<String>,
        backing: ManifestBacking,
        db_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let name = name.into();
        match backing {
            ManifestBacking::Memory => Ok(Self::in_memory(name)),
            ManifestBacking::Sqlite => Self::sqlite(name, db_path),
            ManifestBacking::Auto if engine_supported() => Self::sqlite(name, db_path),
            ManifestBacking::Auto => {
                let (_, found) = sqlite::engine_version();
                warn!(%found, "sqlite too old for the manifest index; keeping entries in memory");
                Ok(Self::in_memory(name))
            }
        }
    }

    fn from_store(name: String, backing: ManifestBacking, store: Box<dyn ManifestStore>) -> Self {
        Self {
            name,
            backing,
            store,
            finalized: RwLock::new(None),
            scope: Mutex::new(TransactionScope::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing actually in use (never `Auto`).
    #[must_use]
    pub fn backing(&self) -> ManifestBacking {
        self.backing
    }

    #[must_use]
    pub fn location(&self) -> Option<&Path> {
        self.store.location()
    }

    pub fn is_finalized(&self) -> Result<bool> {
        Ok(self
            .finalized
            .read()
            .map_err(|_| anyhow!("manifest state lock poisoned"))?
            .is_some())
    }

    /// Insert `entry`, or refresh it when the path already holds the same
    /// digest.
    pub fn add_entry(&self, entry: &Entry) -> Result<()> {
        // Held across the write so finalize cannot interleave with it.
        let state = self
            .finalized
            .read()
            .map_err(|_| anyhow!("manifest state lock poisoned"))?;
        if state.is_some() {
            return Err(ArtifactError::Finalized {
                name: self.name.clone(),
            }
            .into());
        }
        let buffered = self.buffering_on_this_thread()?;
        self.store.upsert(entry, buffered)
    }

    fn buffering_on_this_thread(&self) -> Result<bool> {
        let scope = lock(&self.scope)?;
        Ok(scope.depth > 0 && scope.owner == Some(thread::current().id()))
    }

    /// Run `body` with buffered writes.
    ///
    /// Inserts made on the calling thread are committed every
    /// `max_buffer_size` rows and at scope exit; inserts from other threads
    /// stay write-through. Scopes nest on the owning thread.
    pub fn transaction<T>(&self, body: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        {
            let mut scope = lock(&self.scope)?;
            let current = thread::current().id();
            match scope.owner {
                Some(owner) if owner != current => {}
                _ => {
                    scope.owner = Some(current);
                    scope.depth += 1;
                }
            }
        }
        let result = body(self);
        let outermost = {
            let mut scope = lock(&self.scope)?;
            if scope.owner == Some(thread::current().id()) {
                scope.depth = scope.depth.saturating_sub(1);
                if scope.depth == 0 {
                    scope.owner = None;
                }
            }
            scope.owner.is_none()
        };
        if outermost {
            self.store.flush()?;
        }
        result
    }

    pub fn get_entry_by_path(&self, path: &str) -> Result<Option<Entry>> {
        self.store.get(path)
    }

    /// Entries whose path starts with `prefix`, in path order, fetched a
    /// page at a time.
    #[must_use]
    pub fn entries_under(&self, prefix: &str) -> EntriesUnder<'_> {
        EntriesUnder {
            manifest: self,
            prefix: prefix.to_string(),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Every entry in path order.
    #[must_use]
    pub fn entries(&self) -> EntriesUnder<'_> {
        self.entries_under("")
    }

    pub fn len(&self) -> Result<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Total bytes over entries with a known size.
    pub fn size(&self) -> Result<u64> {
        self.store.total_size()
    }

    /// Hex MD5 over the version preamble and `path:digest` lines in path order.
    pub fn digest(&self) -> Result<String> {
        if let Some(done) = self
            .finalized
            .read()
            .map_err(|_| anyhow!("manifest state lock poisoned"))?
            .as_ref()
        {
            return Ok(done.digest.clone());
        }
        self.store.flush()?;
        self.compute_digest()
    }

    fn compute_digest(&self) -> Result<String> {
        let mut digester = ManifestDigester::new();
        for entry in self.entries() {
            let entry = entry?;
            digester.push(&entry.path, &entry.digest);
        }
        Ok(digester.finish())
    }

    /// Flush buffered writes, release connections and freeze the entry set.
    /// Later calls return the first result without flushing again.
    pub fn finalize(&self) -> Result<FinalizedManifest> {
        let mut state = self
            .finalized
            .write()
            .map_err(|_| anyhow!("manifest state lock poisoned"))?;
        if let Some(done) = state.as_ref() {
            return Ok(done.clone());
        }
        self.store.flush()?;
        let digest = self.compute_digest()?;
        self.store.close()?;
        let done = FinalizedManifest {
            digest,
            location: self.store.location().map(Path::to_path_buf),
        };
        debug!(artifact = %self.name, digest = %done.digest, "manifest finalized");
        *state = Some(done.clone());
        Ok(done)
    }

    /// Record which artifact first uploaded the content at `path`. Allowed
    /// after finalize: the birth id is not part of the digest.
    pub fn set_birth_artifact_id(&self, path: &str, birth_artifact_id: &str) -> Result<()> {
        if self.store.set_birth_artifact_id(path, birth_artifact_id)? {
            Ok(())
        } else {
            Err(anyhow!("manifest has no entry at {path}"))
        }
    }

    /// Manifest document:
    /// `{version, storagePolicy, storagePolicyConfig, contents: {path: entry}}`.
    pub fn to_json(&self, storage_policy: &str, storage_policy_config: Value) -> Result<Value> {
        let mut contents = Map::new();
        for entry in self.entries() {
            let entry = entry?;
            contents.insert(entry.path.clone(), entry.to_json());
        }
        Ok(json!({
            "version": MANIFEST_VERSION,
            "storagePolicy": storage_policy,
            "storagePolicyConfig": storage_policy_config,
            "contents": contents,
        }))
    }
}

impl Drop for Manifest {
    fn drop(&mut self) {
        if let Err(err) = self.store.close() {
            warn!(artifact = %self.name, error = %err, "failed to close manifest store");
        }
    }
}

/// Lazy, keyset-paged walk over manifest entries.
pub struct EntriesUnder<'a> {
    manifest: &'a Manifest,
    prefix: String,
    after: Option<String>,
    buffer: VecDeque<Entry>,
    exhausted: bool,
}

impl Iterator for EntriesUnder<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self
                .manifest
                .store
                .page(&self.prefix, self.after.as_deref(), PAGE_SIZE)
            {
                Ok(page) => {
                    self.exhausted = page.len() < PAGE_SIZE;
                    if let Some(last) = page.last() {
                        self.after = Some(last.path.clone());
                    }
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
