#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use artstore_core::{
    Artifact, ArtifactOptions, ArtifactRef, BackendApi, BatchSettings, ClientArtifactRegistry,
    Config, CreatedFile, FileSpec, ManifestBacking, PolicyConfig, RemoteArtifact, StorageLayout,
    StoragePolicy, TransferSettings, UploadBatcher,
};

/// Control plane double that hands out upload URLs under `upload_base`.
pub struct ScriptedBackend {
    base_url: String,
    upload_base: String,
    artifacts: Mutex<HashMap<String, RemoteArtifact>>,
    stored: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(base_url: impl Into<String>, upload_base: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            upload_base: upload_base.into(),
            artifacts: Mutex::new(HashMap::new()),
            stored: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn publish(&self, artifact: RemoteArtifact) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.id.clone(), artifact);
    }

    pub fn already_stored(&self, md5: &str) {
        self.stored.lock().unwrap().insert(md5.to_string());
    }

    pub fn prepare_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BackendApi for ScriptedBackend {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_key(&self) -> Option<&str> {
        Some("secret")
    }

    fn create_artifact_files(&self, specs: &[FileSpec]) -> Result<HashMap<String, CreatedFile>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stored = self.stored.lock().unwrap();
        Ok(specs
            .iter()
            .map(|spec| {
                let exists = stored.contains(&spec.md5);
                let created = CreatedFile {
                    upload_url: (!exists).then(|| format!("{}/{}", self.upload_base, spec.name)),
                    upload_headers: Vec::new(),
                    artifact: ArtifactRef {
                        id: spec.artifact_id.clone(),
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

pub struct Session {
    pub temp: TempDir,
    pub backend: Arc<ScriptedBackend>,
    pub registry: ClientArtifactRegistry,
    pub policy: Arc<StoragePolicy>,
}

impl Session {
    /// V1-layout policy rooted at `base_url`, with uploads pointed at
    /// `upload_base`.
    pub fn new(base_url: &str, upload_base: &str) -> Result<Self> {
        let temp = tempfile::Builder::new().prefix("artstore-it").tempdir()?;
        let backend = Arc::new(ScriptedBackend::new(base_url, upload_base));
        let registry = ClientArtifactRegistry::default();
        let config = Config::with_cache_root(temp.path().join("cache"))
            .base_url(base_url)
            .storage(PolicyConfig {
                storage_layout: StorageLayout::V1,
                storage_region: "default".into(),
            })
            .transfer(TransferSettings {
                max_attempts: 2,
                backoff_base: Duration::from_millis(1),
                ..TransferSettings::default()
            });
        let policy = Arc::new(StoragePolicy::from_config(
            &config,
            backend.clone(),
            registry.clone(),
        )?);
        Ok(Self {
            temp,
            backend,
            registry,
            policy,
        })
    }

    pub fn artifact(&self, name: &str, backing: ManifestBacking) -> Result<Artifact> {
        Artifact::new(
            name,
            "dataset",
            ArtifactOptions::default().backing(backing),
            self.policy.clone(),
            self.registry.clone(),
        )
    }

    pub fn batcher(&self) -> Result<UploadBatcher> {
        UploadBatcher::start(
            self.backend.clone(),
            BatchSettings {
                batch_time: Duration::from_millis(40),
                inter_event_time: Duration::from_millis(10),
                max_batch_size: 100,
            },
        )
    }

    pub fn write(&self, relative: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.temp.path().join("work").join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }
}
