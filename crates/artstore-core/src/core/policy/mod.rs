//! The default storage policy: binds the content cache, the handler family
//! and the control plane into store/load operations.

mod layout;

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use serde_json::Value;
use tracing::{debug, info};

use artstore_domain::{ArtifactError, Entry, SCHEME_HTTP, SCHEME_HTTPS};

use crate::core::artifact::ClientArtifactRegistry;
use crate::core::backend::{BackendApi, FileSpec};
use crate::core::batcher::UploadBatcher;
use crate::core::cache::ContentCache;
use crate::core::config::{Config, PolicyConfig, TransferSettings, STORAGE_POLICY_NAME};
use crate::core::handlers::{
    ArtifactRefHandler, ClientArtifactHandler, GcsHandler, Handler, HttpHandler, LoadOutcome,
    LocalHandler, MultiHandler, ObjectStoreClient, S3Handler, StoreRequest,
};
use crate::core::net::{http_client, send_with_retry};

use layout::file_url;

/// Result of [`StoragePolicy::store_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    /// The control plane already held the content; nothing was uploaded.
    pub exists: bool,
    pub birth_artifact_id: String,
}

/// Shared by every artifact of a process; holds no per-artifact state.
pub struct StoragePolicy {
    config: PolicyConfig,
    base_url: String,
    cache: ContentCache,
    client: Client,
    transfer: TransferSettings,
    api: Arc<dyn BackendApi>,
    handlers: MultiHandler,
}

impl StoragePolicy {
    /// Policy with the local, HTTP(S) and artifact-reference handlers.
    /// Object stores are attached with [`Self::with_s3_client`] and
    /// [`Self::with_gcs_client`].
    pub fn from_config(
        config: &Config,
        api: Arc<dyn BackendApi>,
        registry: ClientArtifactRegistry,
    ) -> Result<Self> {
        let cache = ContentCache::open(&config.cache.path)?;
        let transfer = config.transfer;
        let client = http_client(&transfer)?;
        let handlers = MultiHandler::new()
            .with(Handler::Local(LocalHandler::new(cache.clone())))
            .with(Handler::Http(HttpHandler::new(
                SCHEME_HTTP,
                client.clone(),
                cache.clone(),
                transfer,
            )))
            .with(Handler::Http(HttpHandler::new(
                SCHEME_HTTPS,
                client.clone(),
                cache.clone(),
                transfer,
            )))
            .with(Handler::ArtifactRef(ArtifactRefHandler::new(api.clone())))
            .with(Handler::ClientArtifact(ClientArtifactHandler::new(registry)));
        debug!(
            cache = %cache.root().display(),
            cache_source = config.cache.source,
            layout = ?config.storage.storage_layout,
            "storage policy ready"
        );
        Ok(Self {
            config: config.storage.clone(),
            base_url: config.base_url.clone(),
            cache,
            client,
            transfer,
            api,
            handlers,
        })
    }

    #[must_use]
    pub fn with_s3_client(mut self, client: Arc<dyn ObjectStoreClient>) -> Self {
        self.handlers = self
            .handlers
            .with(Handler::S3(S3Handler::new(client, self.cache.clone())));
        self
    }

    #[must_use]
    pub fn with_gcs_client(mut self, client: Arc<dyn ObjectStoreClient>) -> Self {
        self.handlers = self
            .handlers
            .with(Handler::Gcs(GcsHandler::new(client, self.cache.clone())));
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        STORAGE_POLICY_NAME
    }

    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// The configuration map as recorded in manifests.
    pub fn config_json(&self) -> Result<Value> {
        serde_json::to_value(&self.config).context("failed to encode storage policy config")
    }

    #[must_use]
    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    #[must_use]
    pub fn schemes(&self) -> Vec<&str> {
        self.handlers.schemes()
    }

    /// Entries for `request`; the caller inserts them into its manifest.
    pub fn store_reference(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        self.handlers.store_path(request)
    }

    /// Resolve a reference entry of an artifact owned by `entity`.
    ///
    /// Cross-artifact references are followed to their terminal entry;
    /// stored terminals are fetched from the control plane (or addressed by
    /// their download URL when `local` is false).
    pub fn load_reference(&self, entity: &str, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        let mut owner = entity.to_string();
        let mut current = entry.clone();
        let mut visited = HashSet::new();
        loop {
            let Some(target) = current.ref_target() else {
                return if local {
                    self.load_file(&owner, &current).map(LoadOutcome::Local)
                } else {
                    self.file_url(&owner, &current).map(LoadOutcome::Remote)
                };
            };
            if !visited.insert(target.to_string()) {
                return Err(ArtifactError::UnresolvedReference {
                    uri: entry.ref_target().unwrap_or_default().to_string(),
                    reason: format!("reference cycle through {target}"),
                }
                .into());
            }
            match self.handlers.load_path(&current, local)? {
                LoadOutcome::Delegate { entity, entry } => {
                    debug!(
                        %target,
                        owner = %entity,
                        path = %entry.path,
                        "reference resolved into another artifact"
                    );
                    owner = entity;
                    current = entry;
                }
                resolved => return Ok(resolved),
            }
        }
    }

    /// Write the entry's bytes through the cache, ask the control plane
    /// where to put them and upload unless it already has them.
    ///
    /// On return the entry points at its cached copy and carries the birth
    /// artifact id the control plane assigned.
    pub fn store_file(
        &self,
        artifact_id: &str,
        artifact_manifest_id: &str,
        entry: &mut Entry,
        batcher: &UploadBatcher,
    ) -> Result<StoreOutcome> {
        let slot = self
            .cache
            .check_md5_obj_path(&entry.digest, entry.cache_size())?;
        if slot.is_hit() {
            entry.set_local_path(slot.path(), entry.cache_size());
        } else if let Some(staged) = entry.local_path().map(Path::to_path_buf) {
            let cached = slot.fill_from_file(&staged)?;
            entry.set_local_path(cached, entry.cache_size());
        }

        let response = batcher.prepare(FileSpec {
            artifact_id: artifact_id.to_string(),
            artifact_manifest_id: artifact_manifest_id.to_string(),
            name: entry.path.clone(),
            md5: entry.digest.clone(),
        })?;
        entry.birth_artifact_id = Some(response.birth_artifact_id.clone());

        let Some(upload_url) = response.upload_url.as_deref() else {
            debug!(path = %entry.path, digest = %entry.digest, "content already stored");
            return Ok(StoreOutcome {
                exists: true,
                birth_artifact_id: response.birth_artifact_id,
            });
        };
        let Some(source) = entry.local_path() else {
            return Err(ArtifactError::InvalidSource {
                source_path: entry.path.clone(),
                reason: "the control plane asked for content with no local copy".into(),
            }
            .into());
        };
        self.upload(upload_url, &response.upload_headers, source)?;
        Ok(StoreOutcome {
            exists: false,
            birth_artifact_id: response.birth_artifact_id,
        })
    }

    fn upload(&self, url: &str, headers: &[String], source: &Path) -> Result<()> {
        let headers = upload_headers(headers)?;
        let size = source
            .metadata()
            .with_context(|| format!("failed to stat {}", source.display()))?
            .len();
        send_with_retry(&self.transfer, url, || {
            let file = File::open(source)
                .with_context(|| format!("failed to open {}", source.display()))?;
            self.client
                .put(url)
                .headers(headers.clone())
                .header(CONTENT_LENGTH, size)
                .body(file)
                .send()
                .with_context(|| format!("PUT {url} failed"))
        })?;
        info!(path = %source.display(), bytes = size, "uploaded file");
        Ok(())
    }

    /// Cached copy of a stored entry of an artifact owned by `entity`,
    /// downloading and MD5-checking it on a miss.
    pub fn load_file(&self, entity: &str, entry: &Entry) -> Result<PathBuf> {
        let slot = self
            .cache
            .check_md5_obj_path(&entry.digest, entry.cache_size())?;
        if slot.is_hit() {
            return Ok(slot.into_path());
        }
        let url = self.file_url(entity, entry)?;
        let mut response = send_with_retry(&self.transfer, &url, || {
            let mut request = self.client.get(&url);
            if let Some(key) = self.api.api_key() {
                request = request.basic_auth("api", Some(key));
            }
            request.send().with_context(|| format!("GET {url} failed"))
        })?;
        let mut writer = slot.writer()?.verify_md5(&entry.digest, &url);
        let bytes = response
            .copy_to(&mut writer)
            .with_context(|| format!("failed to stream {url} into the cache"))?;
        debug!(%url, bytes, "downloaded stored file");
        writer.commit()
    }

    /// Download URL of a stored entry; no network access.
    pub fn file_url(&self, entity: &str, entry: &Entry) -> Result<String> {
        file_url(&self.base_url, &self.config, entity, entry)
    }
}

/// `"Name:Value"` strings from the control plane as request headers.
fn upload_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for header in raw {
        let (name, value) = header.split_once(':').ok_or_else(|| ArtifactError::BackendResponse {
            detail: format!("upload header without a colon: {header}"),
        })?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid upload header name in {header}"))?;
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid upload header value in {header}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
