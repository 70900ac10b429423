use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use artstore_domain::{strip_etag_quotes, ArtifactError, Entry, ReferenceUri, SCHEME_S3};

use super::object_store::{
    collect_prefix, object_entry_naming, ObjectMeta, ObjectStoreClient, DIRECTORY_MARKER,
};
use super::{LoadOutcome, StorageHandler, StoreRequest};
use crate::core::cache::ContentCache;

/// `s3://bucket/key[?versionId=..]` references, addressed by ETag.
pub struct S3Handler {
    client: Arc<dyn ObjectStoreClient>,
    cache: ContentCache,
}

impl S3Handler {
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
    ) -> Entry {
        let (path, reference) = object_entry_naming(SCHEME_S3, bucket, key, &meta.key, name, multi);
        let etag = strip_etag_quotes(meta.etag.as_deref().unwrap_or_default()).to_string();
        let mut extra = BTreeMap::new();
        extra.insert("etag".to_string(), etag.clone());
        if let Some(version) = meta.version_id.as_deref().filter(|v| *v != "null") {
            extra.insert("versionID".to_string(), version.to_string());
        }
        Entry::reference(path, reference, etag)
            .with_size(Some(meta.size))
            .with_extra(extra)
    }

    /// Version whose ETag matches `entry`, when the latest one does not.
    fn matching_version(&self, entry: &Entry, bucket: &str, key: &str) -> Result<Option<String>> {
        let target = entry.ref_target().unwrap_or_default();
        let latest = self
            .client
            .head_object(bucket, key, None)?
            .ok_or_else(|| ArtifactError::ObjectNotFound {
                uri: target.to_string(),
                version: None,
            })?;
        let etag = strip_etag_quotes(latest.etag.as_deref().unwrap_or_default());
        if etag == entry.digest {
            return Ok(None);
        }
        if !self.client.versioning_enabled(bucket)? {
            return Err(ArtifactError::DigestMismatch {
                target: target.to_string(),
                expected: entry.digest.clone(),
                actual: etag.to_string(),
            }
            .into());
        }
        let wanted = entry.extra.get("etag").unwrap_or(&entry.digest);
        debug!(%target, etag = %wanted, "latest object changed; searching versions");
        self.client
            .list_object_versions(bucket, key)?
            .into_iter()
            .find(|version| {
                version.key == key
                    && strip_etag_quotes(version.etag.as_deref().unwrap_or_default()) == wanted
            })
            .and_then(|version| version.version_id)
            .map(Some)
            .ok_or_else(|| {
                ArtifactError::ObjectNotFound {
                    uri: target.to_string(),
                    version: Some(format!("with etag {wanted}")),
                }
                .into()
            })
    }
}

impl StorageHandler for S3Handler {
    fn scheme(&self) -> &str {
        SCHEME_S3
    }

    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        let uri = ReferenceUri::parse(&request.uri)?;
        let (bucket, key) = (uri.host(), uri.key());
        let version = uri.query_param("versionId");
        let canonical = format!("{SCHEME_S3}://{bucket}/{key}");
        if version.is_some() && !self.client.versioning_enabled(bucket)? {
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

        let (multi, objects) = match version.as_deref() {
            Some(version) => {
                let meta = self
                    .client
                    .head_object(bucket, key, Some(version))?
                    .ok_or_else(|| ArtifactError::ObjectNotFound {
                        uri: canonical.clone(),
                        version: Some(version.to_string()),
                    })?;
                (false, vec![meta])
            }
            None => match self.client.head_object(bucket, key, None)? {
                Some(meta)
                    if !meta
                        .content_type
                        .as_deref()
                        .is_some_and(|ct| ct.contains(DIRECTORY_MARKER)) =>
                {
                    (false, vec![meta])
                }
                _ => (
                    true,
                    collect_prefix(
                        self.client.as_ref(),
                        bucket,
                        key,
                        request.max_objects,
                        |meta| meta.size == 0,
                        &canonical,
                    )?,
                ),
            },
        };
        Ok(objects
            .iter()
            .filter(|meta| meta.size > 0)
            .map(|meta| Self::entry_from_object(meta, bucket, key, request.name.as_deref(), multi))
            .collect())
    }

    fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        let target = entry.ref_target().unwrap_or_default();
        if !local {
            return Ok(LoadOutcome::Remote(target.to_string()));
        }
        let slot = self.cache.check_etag_obj_path(&entry.digest, entry.cache_size());
        if slot.is_hit() {
            return Ok(LoadOutcome::Local(slot.into_path()));
        }
        let uri = ReferenceUri::parse(target)?;
        let (bucket, key) = (uri.host(), uri.key());
        let version = match entry.extra.get("versionID") {
            Some(version) => Some(version.clone()),
            None => self.matching_version(entry, bucket, key)?,
        };
        let mut writer = slot.writer()?;
        let bytes = self
            .client
            .download(bucket, key, version.as_deref(), &mut writer)?;
        debug!(%target, bytes, ?version, "downloaded s3 object");
        Ok(LoadOutcome::Local(writer.commit()?))
    }
}
