use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One record of an artifact manifest: a stored file or a reference to
/// content that lives elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub digest: String,
    #[serde(
        rename = "birthArtifactID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub birth_artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
    /// Staging copy inside the content cache; only meaningful until upload.
    #[serde(skip)]
    local_path: Option<PathBuf>,
}

impl Entry {
    #[must_use]
    pub fn new(path: impl AsRef<str>, digest: impl Into<String>) -> Self {
        Self {
            path: normalize_entry_path(path.as_ref()),
            reference: None,
            digest: digest.into(),
            birth_artifact_id: None,
            size: None,
            extra: BTreeMap::new(),
            local_path: None,
        }
    }

    /// A stored file whose bytes are staged at `local_path`.
    #[must_use]
    pub fn staged(
        path: impl AsRef<str>,
        digest: impl Into<String>,
        local_path: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        let mut entry = Self::new(path, digest);
        entry.set_local_path(local_path, size);
        entry
    }

    /// An entry pointing at external content.
    #[must_use]
    pub fn reference(
        path: impl AsRef<str>,
        reference: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        let mut entry = Self::new(path, digest);
        entry.reference = Some(reference.into());
        entry
    }

    #[must_use]
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_extra(mut self, extra: BTreeMap<String, String>) -> Self {
        self.extra = extra;
        self
    }

    #[must_use]
    pub fn with_birth_artifact_id(mut self, id: Option<String>) -> Self {
        self.birth_artifact_id = id;
        self
    }

    #[must_use]
    pub fn local_path(&self) -> Option<&Path> {
        self.local_path.as_deref()
    }

    /// Setting a staging path always records the size alongside it.
    pub fn set_local_path(&mut self, local_path: impl Into<PathBuf>, size: u64) {
        self.local_path = Some(local_path.into());
        self.size = Some(size);
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// The external location of a reference entry.
    #[must_use]
    pub fn ref_target(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// Size used for cache addressing; unknown sizes address as zero.
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// Manifest `contents` form: only populated fields, sizes kept even when
    /// zero.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        if !self.digest.is_empty() {
            out.insert("digest".into(), Value::String(self.digest.clone()));
        }
        if let Some(reference) = self.reference.as_ref().filter(|r| !r.is_empty()) {
            out.insert("ref".into(), Value::String(reference.clone()));
        }
        if let Some(birth) = self.birth_artifact_id.as_ref().filter(|b| !b.is_empty()) {
            out.insert("birthArtifactID".into(), Value::String(birth.clone()));
        }
        if let Some(size) = self.size {
            out.insert("size".into(), Value::from(size));
        }
        if !self.extra.is_empty() {
            let extra = self
                .extra
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            out.insert("extra".into(), Value::Object(extra));
        }
        Value::Object(out)
    }
}

/// Entry paths always use forward slashes.
#[must_use]
pub fn normalize_entry_path(path: &str) -> String {
    if cfg!(windows) {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

/// Join logical path segments with forward slashes, skipping empty parts.
#[must_use]
pub fn join_entry_path(prefix: Option<&str>, rest: &str) -> String {
    let rest = normalize_entry_path(rest);
    match prefix.map(normalize_entry_path) {
        Some(prefix) if !prefix.is_empty() => {
            format!("{}/{}", prefix.trim_end_matches('/'), rest.trim_start_matches('/'))
        }
        _ => rest,
    }
}

/// Final path component of a forward-slash path or URI.
#[must_use]
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
