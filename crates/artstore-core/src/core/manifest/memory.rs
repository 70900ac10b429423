use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;

use artstore_domain::{ArtifactError, Entry};

use super::{lock, ManifestStore};

/// Entries held in a path-ordered map; nothing survives the process.
#[derive(Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl ManifestStore for MemoryStore {
    fn upsert(&self, entry: &Entry, _buffered: bool) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        if let Some(existing) = entries.get(&entry.path) {
            if existing.digest != entry.digest {
                return Err(ArtifactError::PathConflict {
                    path: entry.path.clone(),
                    existing: existing.digest.clone(),
                    attempted: entry.digest.clone(),
                }
                .into());
            }
        }
        entries.insert(entry.path.clone(), entry.clone());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Entry>> {
        Ok(lock(&self.entries)?.get(path).cloned())
    }

    fn page(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Entry>> {
        let entries = lock(&self.entries)?;
        let start = match after {
            Some(after) => Bound::Excluded(after),
            None => Bound::Included(prefix),
        };
        Ok(entries
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(prefix))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn set_birth_artifact_id(&self, path: &str, birth_artifact_id: &str) -> Result<bool> {
        let mut entries = lock(&self.entries)?;
        Ok(match entries.get_mut(path) {
            Some(entry) => {
                entry.birth_artifact_id = Some(birth_artifact_id.to_string());
                true
            }
            None => false,
        })
    }

    fn len(&self) -> Result<usize> {
        Ok(lock(&self.entries)?.len())
    }

    fn total_size(&self) -> Result<u64> {
        Ok(lock(&self.entries)?
            .values()
            .filter_map(|entry| entry.size)
            .sum())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        None
    }
}
