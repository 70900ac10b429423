use anyhow::Result;
use tracing::warn;

use artstore_domain::{ArtifactError, Entry};

use super::{LoadOutcome, StorageHandler, StoreRequest};

/// Records references it cannot inspect; the URI doubles as the digest.
#[derive(Debug, Clone, Default)]
pub struct TrackingHandler {
    scheme: String,
}

impl TrackingHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracking handler registered for one explicit scheme.
    #[must_use]
    pub fn for_scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
        }
    }
}

impl StorageHandler for TrackingHandler {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        let name = request
            .name
            .as_deref()
            .ok_or_else(|| ArtifactError::MissingName {
                uri: request.uri.clone(),
            })?;
        warn!(
            uri = %request.uri,
            "artifact references with unsupported schemes cannot be checksummed"
        );
        Ok(vec![Entry::reference(name, &request.uri, &request.uri)])
    }

    fn load_path(&self, entry: &Entry, local: bool) -> Result<LoadOutcome> {
        let target = entry.ref_target().unwrap_or(&entry.path).to_string();
        if local {
            return Err(ArtifactError::UnresolvedReference {
                uri: target,
                reason: "untracked references cannot be downloaded".into(),
            }
            .into());
        }
        Ok(LoadOutcome::Remote(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_required() {
        let err = TrackingHandler::new()
            .store_path(&StoreRequest::new("custom://thing"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArtifactError>(),
            Some(ArtifactError::MissingName { uri }) if uri == "custom://thing"
        ));
    }

    #[test]
    fn tracked_references_load_only_remotely() -> Result<()> {
        let handler = TrackingHandler::for_scheme("custom");
        let entries =
            handler.store_path(&StoreRequest::new("custom://thing").name(Some("thing")))?;
        assert_eq!(entries[0].path, "thing");
        assert_eq!(
            handler.load_path(&entries[0], false)?,
            LoadOutcome::Remote("custom://thing".into())
        );
        assert!(handler.load_path(&entries[0], true).is_err());
        Ok(())
    }
}
