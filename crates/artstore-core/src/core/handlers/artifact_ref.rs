use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use artstore_domain::{
    b64_to_hex_id, basename, hex_to_b64_id, scheme_of, ArtifactError, Entry, ReferenceUri,
    SCHEME_ARTIFACT,
};

use super::{LoadOutcome, StorageHandler, StoreRequest};
use crate::core::backend::{BackendApi, RemoteArtifact};

/// `wandb-artifact://{hex artifact id}/{path}` references to entries of
/// logged artifacts.
pub struct ArtifactRefHandler {
    api: Arc<dyn BackendApi>,
}

impl ArtifactRefHandler {
    #[must_use]
    pub fn new(api: Arc<dyn BackendApi>) -> Self {
        Self { api }
    }

    fn fetch(&self, uri: &ReferenceUri) -> Result<(RemoteArtifact, Entry)> {
        let artifact = self.api.artifact_manifest(&hex_to_b64_id(uri.host())?)?;
        let entry = artifact.entry(uri.key()).cloned().ok_or_else(|| {
            ArtifactError::UnresolvedReference {
                uri: uri.to_string(),
                reason: format!("artifact has no entry at {}", uri.key()),
            }
        })?;
        Ok((artifact, entry))
    }
}

impl StorageHandler for ArtifactRefHandler {
    fn scheme(&self) -> &str {
        SCHEME_ARTIFACT
    }

    /// Follows reference chains until the entry found is not itself a
    /// cross-artifact reference, and records a single hop to it.
    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        let mut current = request.uri.clone();
        let mut visited = HashSet::new();
        let (artifact_id, path, terminal) = loop {
            if !visited.insert(current.clone()) {
                return Err(ArtifactError::UnresolvedReference {
                    uri: request.uri.clone(),
                    reason: format!("reference cycle through {current}"),
                }
                .into());
            }
            let uri = ReferenceUri::parse(&current)?;
            let (artifact, entry) = self.fetch(&uri)?;
            match entry.ref_target() {
                Some(next) if scheme_of(next) == Some(SCHEME_ARTIFACT) => {
                    debug!(from = %current, to = %next, "following cross-artifact reference");
                    current = next.to_string();
                }
                _ => break (artifact.id, uri.key().to_string(), entry),
            }
        };

        let target = format!("{SCHEME_ARTIFACT}://{}/{path}", b64_to_hex_id(&artifact_id)?);
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| basename(&target).to_string());
        Ok(vec![
            Entry::reference(name, target, terminal.digest).with_size(Some(0))
        ])
    }

    fn load_path(&self, entry: &Entry, _local: bool) -> Result<LoadOutcome> {
        let target = entry.ref_target().unwrap_or_default();
        let (artifact, found) = self.fetch(&ReferenceUri::parse(target)?)?;
        Ok(LoadOutcome::Delegate {
            entity: artifact.entity,
            entry: found,
        })
    }
}
