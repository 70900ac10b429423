use std::collections::BTreeMap;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, ETAG};
use tracing::debug;

use artstore_domain::{basename, strip_etag_quotes, ArtifactError, Entry};

use super::{LoadOutcome, StorageHandler, StoreRequest};
use crate::core::cache::ContentCache;
use crate::core::config::TransferSettings;
use crate::core::net::send_with_retry;

/// Plain `http(s)://` references, addressed by the response ETag.
#[derive(Clone)]
pub struct HttpHandler {
    scheme: String,
    client: Client,
    cache: ContentCache,
    transfer: TransferSettings,
}

struct ResponseDigest {
    digest: Option<String>,
    size: Option<u64>,
    extra: BTreeMap<String, String>,
}

fn digest_from_headers(headers: &HeaderMap) -> ResponseDigest {
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok());
    let raw_etag = headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());
    let mut extra = BTreeMap::new();
    if let Some(etag) = raw_etag {
        extra.insert("etag".to_string(), etag.to_string());
    }
    ResponseDigest {
        digest: raw_etag.map(|etag| strip_etag_quotes(etag).to_string()),
        size,
        extra,
    }
}

impl HttpHandler {
    #[must_use]
    pub fn new(
        scheme: impl Into<String>,
        client: Client,
        cache: ContentCache,
        transfer: TransferSettings,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            client,
            cache,
            transfer,
        }
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        send_with_retry(&self.transfer, url, || {
            self.client
                .get(url)
                .send()
                .with_context(|| format!("GET {url} failed"))
        })
    }
}

impl StorageHandler for HttpHandler {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        let url = request.uri.as_str();
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| basename(url).to_string());
        if !request.checksum {
            return Ok(vec![Entry::reference(name, url, url)]);
        }
        let response = self.get(url)?;
        let found = digest_from_headers(response.headers());
        let digest = found.digest.unwrap_or_else(|| url.to_string());
        Ok(vec![Entry::reference(name, url, digest)
            .with_size(found.size)
            .with_extra(found.extra)])
    }

    fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        let url = entry.ref_target().unwrap_or_default();
        if !local {
            return Ok(LoadOutcome::Remote(url.to_string()));
        }
        let slot = self.cache.check_etag_obj_path(&entry.digest, entry.cache_size());
        if slot.is_hit() {
            return Ok(LoadOutcome::Local(slot.into_path()));
        }
        let mut response = self.get(url)?;
        let digest = digest_from_headers(response.headers())
            .digest
            .unwrap_or_else(|| url.to_string());
        if digest != entry.digest {
            return Err(ArtifactError::DigestMismatch {
                target: url.to_string(),
                expected: entry.digest.clone(),
                actual: digest,
            }
            .into());
        }
        let mut writer = slot.writer()?;
        let bytes = response
            .copy_to(&mut writer)
            .with_context(|| format!("failed to stream {url} into the cache"))?;
        debug!(%url, bytes, "downloaded http reference");
        Ok(LoadOutcome::Local(writer.commit()?))
    }
}
