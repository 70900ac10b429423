//! Blocking contract over an object-store SDK (S3, GCS).
//!
//! Handlers only see the calls below; binding a real SDK is up to the
//! embedding application.

use std::io::Write;

use anyhow::Result;
use tracing::info;

use artstore_domain::ArtifactError;

const LIST_PAGE_SIZE: usize = 1_000;

/// Content type substring of folder placeholder objects.
pub(crate) const DIRECTORY_MARKER: &str = "x-directory";

/// Metadata of one stored object (or one version of it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// ETag as the store reports it, possibly quoted.
    pub etag: Option<String>,
    /// Base64 MD5 of the content, when the store exposes one.
    pub md5: Option<String>,
    /// S3 version id or GCS generation.
    pub version_id: Option<String>,
    pub content_type: Option<String>,
}

pub trait ObjectStoreClient: Send + Sync {
    /// Metadata of `key` (at `version` when given); `None` when absent.
    fn head_object(&self, bucket: &str, key: &str, version: Option<&str>)
        -> Result<Option<ObjectMeta>>;

    /// Up to `limit` objects whose key starts with `prefix`, in key order,
    /// strictly after `start_after` when given.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ObjectMeta>>;

    /// Every stored version of `key`, newest first.
    fn list_object_versions(&self, bucket: &str, key: &str) -> Result<Vec<ObjectMeta>>;

    fn versioning_enabled(&self, bucket: &str) -> Result<bool>;

    /// Stream the object bytes into `sink`, returning the byte count.
    fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        sink: &mut dyn Write,
    ) -> Result<u64>;
}

/// Zero-byte object standing in for a folder: a key ending in `/` or a
/// directory content type.
pub(crate) fn is_directory_placeholder(meta: &ObjectMeta) -> bool {
    meta.size == 0
        && (meta.key.ends_with('/')
            || meta
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.contains(DIRECTORY_MARKER)))
}

/// Objects under `prefix`, paged from the store until more than
/// `max_objects` are seen. Exactly `max_objects` is accepted; objects
/// matching `skip` are not counted.
pub(crate) fn collect_prefix(
    client: &dyn ObjectStoreClient,
    bucket: &str,
    prefix: &str,
    max_objects: usize,
    skip: fn(&ObjectMeta) -> bool,
    uri: &str,
) -> Result<Vec<ObjectMeta>> {
    info!(%uri, max_objects, "generating checksums for objects under prefix");
    let page_size = max_objects.saturating_add(1).min(LIST_PAGE_SIZE);
    let mut objects = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let page = client.list_objects(bucket, prefix, after.as_deref(), page_size)?;
        let exhausted = page.len() < page_size;
        after = page.last().map(|meta| meta.key.clone());
        for meta in page {
            if skip(&meta) {
                continue;
            }
            if objects.len() == max_objects {
                return Err(ArtifactError::TooManyObjects {
                    uri: uri.to_string(),
                    max_objects,
                }
                .into());
            }
            objects.push(meta);
        }
        if exhausted || after.is_none() {
            return Ok(objects);
        }
    }
}

/// Logical name and reference URI of `object_key` found while storing
/// `bucket/key`.
///
/// Unnamed prefix adds keep the path relative to the prefix; a single
/// object keeps its basename. Named prefix adds nest under the name.
pub(crate) fn object_entry_naming(
    scheme: &str,
    bucket: &str,
    key: &str,
    object_key: &str,
    name: Option<&str>,
    multi: bool,
) -> (String, String) {
    let trimmed = key.trim_end_matches('/');
    let base = if trimmed.is_empty() {
        bucket.to_string()
    } else {
        format!("{bucket}/{trimmed}")
    };
    let relative = object_key
        .strip_prefix(key)
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|rest| !rest.is_empty());
    match (name, relative) {
        (None, Some(relative)) => (relative.to_string(), format!("{scheme}://{base}/{relative}")),
        (None, None) => (
            artstore_domain::basename(object_key).to_string(),
            format!("{scheme}://{base}"),
        ),
        (Some(name), Some(relative)) if multi => (
            format!("{}/{relative}", name.trim_end_matches('/')),
            format!("{scheme}://{base}/{relative}"),
        ),
        (Some(name), _) => (name.to_string(), format!("{scheme}://{base}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unnamed_prefix_keeps_relative_paths() {
        assert_eq!(
            object_entry_naming("s3", "bucket", "data", "data/train/a.csv", None, true),
            (
                "train/a.csv".to_string(),
                "s3://bucket/data/train/a.csv".to_string()
            )
        );
    }

    #[test]
    fn folder_keys_do_not_double_the_separator() {
        assert_eq!(
            object_entry_naming("gs", "bucket", "logs/", "logs/0.json", None, true),
            ("0.json".to_string(), "gs://bucket/logs/0.json".to_string())
        );
    }

    #[test]
    fn placeholders_are_empty_folder_objects() {
        let folder = ObjectMeta {
            key: "logs/".into(),
            ..ObjectMeta::default()
        };
        assert!(is_directory_placeholder(&folder));
        let marked = ObjectMeta {
            key: "logs".into(),
            content_type: Some("application/x-directory".into()),
            ..ObjectMeta::default()
        };
        assert!(is_directory_placeholder(&marked));
        let empty_file = ObjectMeta {
            key: "logs/empty.txt".into(),
            ..ObjectMeta::default()
        };
        assert!(!is_directory_placeholder(&empty_file));
    }

    #[test]
    fn single_object_uses_its_basename() {
        assert_eq!(
            object_entry_naming("gs", "bucket", "data/a.csv", "data/a.csv", None, false),
            ("a.csv".to_string(), "gs://bucket/data/a.csv".to_string())
        );
    }

    #[test]
    fn named_prefix_nests_under_the_name() {
        assert_eq!(
            object_entry_naming("s3", "bucket", "data", "data/x/y.bin", Some("inputs"), true),
            (
                "inputs/x/y.bin".to_string(),
                "s3://bucket/data/x/y.bin".to_string()
            )
        );
        assert_eq!(
            object_entry_naming("s3", "bucket", "data/y.bin", "data/y.bin", Some("renamed"), false),
            ("renamed".to_string(), "s3://bucket/data/y.bin".to_string())
        );
    }
}
