use std::fmt;

use anyhow::Result;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::ArtifactError;

pub const SCHEME_FILE: &str = "file";
pub const SCHEME_S3: &str = "s3";
pub const SCHEME_GCS: &str = "gs";
pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_HTTPS: &str = "https";
pub const SCHEME_ARTIFACT: &str = "wandb-artifact";
pub const SCHEME_CLIENT_ARTIFACT: &str = "wandb-client-artifact";

/// A parsed reference URI: `scheme://host/path?query#fragment`.
///
/// The host is the bucket for object stores, the artifact id for
/// cross-artifact references and the first path segment for `file://`
/// references written without a leading slash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceUri {
    raw: String,
    url: Url,
    path: String,
}

impl ReferenceUri {
    /// Parse `raw`; strings without a scheme are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|err| ArtifactError::InvalidSource {
            source_path: raw.to_string(),
            reason: format!("references must be URIs ({err}); use file:// for local paths"),
        })?;
        let path = percent_decode_str(url.path())
            .decode_utf8_lossy()
            .into_owned();
        Ok(Self {
            raw: raw.to_string(),
            url,
            path,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Host portion; empty for `file:///abs` style URIs.
    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// Decoded path including its leading slash.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Decoded path with the leading slash removed (an object key).
    #[must_use]
    pub fn key(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    #[must_use]
    pub fn fragment(&self) -> Option<&str> {
        self.url.fragment().filter(|f| !f.is_empty())
    }

    /// Filesystem path named by a `file://` URI (host and path joined).
    #[must_use]
    pub fn local_path(&self) -> String {
        format!("{}{}", self.host(), self.path)
    }

    /// `scheme://host/key` with query and fragment dropped.
    #[must_use]
    pub fn without_version(&self) -> String {
        format!("{}://{}/{}", self.scheme(), self.host(), self.key())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ReferenceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Scheme of `raw` without full validation, for dispatch.
#[must_use]
pub fn scheme_of(raw: &str) -> Option<&str> {
    let (scheme, _) = raw.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}
