//! In-memory stand-ins for the object store and the control plane.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use artstore_domain::{b64_to_hex, md5_b64};

use crate::core::backend::{ArtifactRef, BackendApi, CreatedFile, FileSpec, RemoteArtifact};
use crate::core::handlers::{ObjectMeta, ObjectStoreClient};

#[derive(Default)]
struct Bucket {
    versioned: bool,
    next_version: u64,
    /// Versions of each key, oldest first.
    objects: BTreeMap<String, Vec<(ObjectMeta, Vec<u8>)>>,
}

#[derive(Default)]
pub(crate) struct MemoryObjectStore {
    buckets: Mutex<BTreeMap<String, Bucket>>,
}

impl MemoryObjectStore {
    pub(crate) fn set_versioning(&self, bucket: &str, enabled: bool) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.entry(bucket.to_string()).or_default().versioned = enabled;
    }

    pub(crate) fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> ObjectMeta {
        self.put_with_type(bucket, key, bytes, "application/octet-stream")
    }

    pub(crate) fn put_with_type(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> ObjectMeta {
        let mut buckets = self.buckets.lock().unwrap();
        let state = buckets.entry(bucket.to_string()).or_default();
        state.next_version += 1;
        let version_id = if state.versioned {
            state.next_version.to_string()
        } else {
            "null".to_string()
        };
        let meta = ObjectMeta {
            key: key.to_string(),
            size: bytes.len() as u64,
            etag: Some(format!("\"{}\"", md5_hex_bytes(bytes))),
            md5: Some(md5_b64(bytes)),
            version_id: Some(version_id),
            content_type: Some(content_type.to_string()),
        };
        let versions = state.objects.entry(key.to_string()).or_default();
        if !state.versioned {
            versions.clear();
        }
        versions.push((meta.clone(), bytes.to_vec()));
        meta
    }

    fn find(&self, bucket: &str, key: &str, version: Option<&str>) -> Option<(ObjectMeta, Vec<u8>)> {
        let buckets = self.buckets.lock().unwrap();
        let versions = buckets.get(bucket)?.objects.get(key)?;
        match version {
            Some(version) => versions
                .iter()
                .find(|(meta, _)| meta.version_id.as_deref() == Some(version))
                .cloned(),
            None => versions.last().cloned(),
        }
    }
}

/// Hex MD5, as S3 reports for single-part uploads.
fn md5_hex_bytes(bytes: &[u8]) -> String {
    b64_to_hex(&md5_b64(bytes)).unwrap()
}

impl ObjectStoreClient for MemoryObjectStore {
    fn head_object(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
    ) -> Result<Option<ObjectMeta>> {
        Ok(self.find(bucket, key, version).map(|(meta, _)| meta))
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ObjectMeta>> {
        let buckets = self.buckets.lock().unwrap();
        let Some(state) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| start_after.map_or(true, |after| key.as_str() > after))
            .filter_map(|(_, versions)| versions.last().map(|(meta, _)| meta.clone()))
            .take(limit)
            .collect())
    }

    fn list_object_versions(&self, bucket: &str, key: &str) -> Result<Vec<ObjectMeta>> {
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets
            .get(bucket)
            .and_then(|state| state.objects.get(key))
            .map(|versions| versions.iter().rev().map(|(meta, _)| meta.clone()).collect())
            .unwrap_or_default())
    }

    fn versioning_enabled(&self, bucket: &str) -> Result<bool> {
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.get(bucket).is_some_and(|state| state.versioned))
    }

    fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        sink: &mut dyn Write,
    ) -> Result<u64> {
        let (_, bytes) = self
            .find(bucket, key, version)
            .ok_or_else(|| anyhow!("no object {bucket}/{key} at {version:?}"))?;
        sink.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }
}

/// Control plane that serves fixed artifacts and answers prepare calls.
pub(crate) struct StaticBackend {
    base_url: String,
    artifacts: Mutex<HashMap<String, RemoteArtifact>>,
    stored_md5s: Mutex<HashSet<String>>,
    pub(crate) prepared: Mutex<Vec<FileSpec>>,
}

impl StaticBackend {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            artifacts: Mutex::new(HashMap::new()),
            stored_md5s: Mutex::new(HashSet::new()),
            prepared: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_artifact(&self, artifact: RemoteArtifact) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.id.clone(), artifact);
    }

    /// Content the control plane already holds; prepare answers without an
    /// upload URL.
    pub(crate) fn mark_stored(&self, md5: &str) {
        self.stored_md5s.lock().unwrap().insert(md5.to_string());
    }
}

impl BackendApi for StaticBackend {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> Option<&str> {
        Some("test-key")
    }

    fn create_artifact_files(&self, specs: &[FileSpec]) -> Result<HashMap<String, CreatedFile>> {
        self.prepared.lock().unwrap().extend(specs.iter().cloned());
        let stored = self.stored_md5s.lock().unwrap();
        Ok(specs
            .iter()
            .map(|spec| {
                let exists = stored.contains(&spec.md5);
                let created = CreatedFile {
                    upload_url: (!exists)
                        .then(|| format!("{}/upload/{}", self.base_url, spec.name)),
                    upload_headers: vec![format!("Content-MD5:{}", spec.md5)],
                    artifact: ArtifactRef {
                        id: if exists {
                            "QXJ0aWZhY3Q6b2xkZXI=".to_string()
                        } else {
                            spec.artifact_id.clone()
                        },
                    },
                };
                (spec.name.clone(), created)
            })
            .collect())
    }

    fn artifact_manifest(&self, artifact_id: &str) -> Result<RemoteArtifact> {
        self.artifacts
            .lock()
            .unwrap()
            .get(artifact_id)
            .cloned()
            .ok_or_else(|| anyhow!("artifact {artifact_id} not found"))
    }
}
