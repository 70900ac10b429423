use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use tracing::debug;

use crate::core::manifest::{lock, Manifest};

/// In-process index of artifacts that have not been logged yet, keyed by
/// client id. Holds weak handles so a dropped artifact disappears from the
/// index without an explicit removal.
#[derive(Clone, Default)]
pub struct ClientArtifactRegistry {
    manifests: Arc<Mutex<HashMap<String, Weak<Manifest>>>>,
}

impl ClientArtifactRegistry {
    pub fn register(&self, client_id: &str, manifest: &Arc<Manifest>) -> Result<()> {
        let mut manifests = lock(&self.manifests)?;
        manifests.retain(|_, handle| handle.strong_count() > 0);
        manifests.insert(client_id.to_string(), Arc::downgrade(manifest));
        debug!(client_id, artifact = manifest.name(), "registered unlogged artifact");
        Ok(())
    }

    /// The manifest registered under `client_id`, if its artifact is alive.
    pub fn get(&self, client_id: &str) -> Result<Option<Arc<Manifest>>> {
        Ok(lock(&self.manifests)?
            .get(client_id)
            .and_then(Weak::upgrade))
    }

    pub fn remove(&self, client_id: &str) -> Result<bool> {
        Ok(lock(&self.manifests)?.remove(client_id).is_some())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.manifests)?
            .values()
            .filter(|handle| handle.strong_count() > 0)
            .count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
