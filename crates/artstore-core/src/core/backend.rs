//! Narrow contracts with the control plane.
//!
//! The authenticated network client lives outside this crate; the store only
//! needs the request/response shapes below.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use artstore_domain::Entry;

/// One file of a "create artifact files" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(rename = "artifactID")]
    pub artifact_id: String,
    #[serde(rename = "artifactManifestID")]
    pub artifact_manifest_id: String,
    pub name: String,
    pub md5: String,
}

/// Per-file answer: where to upload, or `upload_url: None` when the control
/// plane already holds the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedFile {
    #[serde(rename = "uploadUrl")]
    pub upload_url: Option<String>,
    #[serde(rename = "uploadHeaders", default)]
    pub upload_headers: Vec<String>,
    pub artifact: ArtifactRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
}

/// A logged artifact as returned by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    /// Base64 artifact id.
    pub id: String,
    pub entity: String,
    pub entries: Vec<Entry>,
}

impl RemoteArtifact {
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.path == path)
    }
}

pub trait BackendApi: Send + Sync {
    /// Control-plane root used for per-entry download URLs.
    fn base_url(&self) -> &str;

    /// Key sent as the password of `api:<key>` basic auth on downloads.
    fn api_key(&self) -> Option<&str>;

    /// Batched upload preparation, keyed by file name.
    fn create_artifact_files(&self, specs: &[FileSpec]) -> Result<HashMap<String, CreatedFile>>;

    /// Manifest of a logged artifact, by base64 id.
    fn artifact_manifest(&self, artifact_id: &str) -> Result<RemoteArtifact>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names_match_the_control_plane() -> Result<()> {
        let spec = FileSpec {
            artifact_id: "QQ==".into(),
            artifact_manifest_id: "TQ==".into(),
            name: "data/train.csv".into(),
            md5: "1B2M2Y8AsgTpgAmY7PhCfg==".into(),
        };
        assert_eq!(
            serde_json::to_value(&spec)?,
            json!({
                "artifactID": "QQ==",
                "artifactManifestID": "TQ==",
                "name": "data/train.csv",
                "md5": "1B2M2Y8AsgTpgAmY7PhCfg==",
            })
        );

        let created: CreatedFile = serde_json::from_value(json!({
            "uploadUrl": null,
            "artifact": {"id": "QmlydGg="},
        }))?;
        assert_eq!(created.upload_url, None);
        assert!(created.upload_headers.is_empty());
        assert_eq!(created.artifact.id, "QmlydGg=");
        Ok(())
    }
}
