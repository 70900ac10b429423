use anyhow::Result;

use artstore_domain::{basename, ArtifactError, Entry, ReferenceUri, SCHEME_CLIENT_ARTIFACT};

use super::{LoadOutcome, StorageHandler, StoreRequest};
use crate::core::artifact::ClientArtifactRegistry;

/// `wandb-client-artifact://{client id}/{path}` references to artifacts
/// that exist only in this process so far.
#[derive(Clone)]
pub struct ClientArtifactHandler {
    registry: ClientArtifactRegistry,
}

impl ClientArtifactHandler {
    #[must_use]
    pub fn new(registry: ClientArtifactRegistry) -> Self {
        Self { registry }
    }
}

impl StorageHandler for ClientArtifactHandler {
    fn scheme(&self) -> &str {
        SCHEME_CLIENT_ARTIFACT
    }

    fn store_path(&self, request: &StoreRequest) -> Result<Vec<Entry>> {
        let uri = ReferenceUri::parse(&request.uri)?;
        let unresolved = |reason: &str| ArtifactError::UnresolvedReference {
            uri: request.uri.clone(),
            reason: reason.to_string(),
        };
        let manifest = self
            .registry
            .get(uri.host())?
            .ok_or_else(|| unresolved("no unlogged artifact with this client id"))?;
        let target = manifest
            .get_entry_by_path(uri.key())?
            .ok_or_else(|| unresolved("the artifact has no entry at this path"))?;
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| basename(&request.uri).to_string());
        Ok(vec![Entry::reference(name, &request.uri, target.digest).with_size(Some(0))])
    }

    fn load_path(&self, entry: &Entry, _local: bool) -> Result<LoadOutcome> {
        Err(ArtifactError::UnresolvedReference {
            uri: entry.ref_target().unwrap_or_default().to_string(),
            reason: "the referenced artifact has not been logged yet".into(),
        }
        .into())
    }
}
