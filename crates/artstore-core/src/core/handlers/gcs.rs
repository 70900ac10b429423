use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use artstore_domain::{ArtifactError, Entry, ReferenceUri, SCHEME_GCS};

use super::object_store::{
    collect_prefix, is_directory_placeholder, object_entry_naming, ObjectMeta, ObjectStoreClient,
};
use super::{LoadOutcome, StorageHandler, StoreRequest};
use crate::core::cache::ContentCache;

/// `gs://bucket/key[#generation]` references, addressed by content MD5.
pub struct GcsHandler {
    client: Arc<dyn ObjectStoreClient>,
    cache: ContentCache,
}

impl GcsHandler {
    #[must_use]
    pub fn new(client: Arc<dyn ObjectStoreClient>, cache: ContentCache) -> Self {
        Self { client, cache }
    }

    fn entry_from_object(
        meta: &ObjectMeta,
        bucket: &str,
        key: &str,
        name: Option<&str>,
        multi: bool,
    ) -> Result<Entry> {
        let (path, reference) =
            object_entry_naming(SCHEME_GCS, bucket, key, &meta.key, name, multi);
        let md5 = meta
            .md5
            .clone()
            .ok_or_else(|| ArtifactError::BackendResponse {
                detail: format!("object {reference} has no md5 hash"),
            })?;
        let mut extra = BTreeMap::new();
        if let Some(etag) = &meta.etag {
            extra.insert("etag".to_string(), etag.clone());
        }
        if let Some(generation) = &meta.version_id {
            extra.insert("versionID".to_string(), generation.clone());
        }
        Ok(Entry::reference(path, reference, md5)
            .with_size(Some(meta.size))
            .with_extra(extra))
    }

    /// Generation to download: the recorded one if it still exists,
    /// otherwise the latest after checking its MD5.
    fn pick_generation(&self, entry: &Entry, bucket: &str, key: &str) -> Result<Option<String>> {
        let target = entry.ref_target().unwrap_or_default();
        let recorded = entry.extra.get("versionID");
        if let Some(generation) = recorded {
            if self
                .client
                .head_object(bucket, key, Some(generation))?
                .is_some()
            {
                return Ok(Some(generation.clone()));
            }
        }
        let latest = self
            .client
            .head_object(bucket, key, None)?
            .ok_or_else(|| ArtifactError::ObjectNotFound {
                uri: target.to_string(),
                version: recorded.cloned(),
            })?;
        let md5 = latest.md5.unwrap_or_default();
        if md5 != entry.digest {
            return Err(ArtifactError::DigestMismatch {
                target: target.to_string(),
                expected: entry.digest.clone(),
                actual: md5,
            }
            .into());
        }
        Ok(None)
    }
}

impl StorageHandler for GcsHandler {
    fn scheme(&self) -> &str {
        SCHEME_GCS
    }

    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        let uri = ReferenceUri::parse(&request.uri)?;
        let (bucket, key) = (uri.host(), uri.key());
        let generation = uri.fragment();
        let canonical = format!("{SCHEME_GCS}://{bucket}/{key}");
        if generation.is_some() && !self.client.versioning_enabled(bucket)? {
            return Err(ArtifactError::VersioningDisabled {
                uri: request.uri.clone(),
                bucket: bucket.to_string(),
            }
            .into());
        }
        if !request.checksum {
            let name = request.name.as_deref().unwrap_or(key);
            return Ok(vec![Entry::reference(name, &canonical, &canonical)]);
        }

        let found = self.client.head_object(bucket, key, generation)?;
        let (multi, objects) = match (found, generation) {
            (Some(meta), Some(_)) => (false, vec![meta]),
            (Some(meta), None) if !is_directory_placeholder(&meta) => (false, vec![meta]),
            (None, Some(generation)) => {
                return Err(ArtifactError::ObjectNotFound {
                    uri: canonical,
                    version: Some(generation.to_string()),
                }
                .into())
            }
            (_, None) => (
                true,
                collect_prefix(
                    self.client.as_ref(),
                    bucket,
                    key,
                    request.max_objects,
                    is_directory_placeholder,
                    &canonical,
                )?,
            ),
        };
        objects
            .iter()
            .map(|meta| Self::entry_from_object(meta, bucket, key, request.name.as_deref(), multi))
            .collect()
    }

    fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        let target = entry.ref_target().unwrap_or_default();
        if !local {
            return Ok(LoadOutcome::Remote(target.to_string()));
        }
        let slot = self
            .cache
            .check_md5_obj_path(&entry.digest, entry.cache_size())?;
        if slot.is_hit() {
            return Ok(LoadOutcome::Local(slot.into_path()));
        }
        let uri = ReferenceUri::parse(target)?;
        let (bucket, key) = (uri.host(), uri.key());
        let generation = self.pick_generation(entry, bucket, key)?;
        let mut writer = slot.writer()?.verify_md5(&entry.digest, target);
        let bytes = self
            .client
            .download(bucket, key, generation.as_deref(), &mut writer)?;
        debug!(%target, bytes, ?generation, "downloaded gcs object");
        Ok(LoadOutcome::Local(writer.commit()?))
    }
}
