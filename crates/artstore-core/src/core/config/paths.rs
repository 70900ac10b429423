use std::path::PathBuf;

use anyhow::{Context, Result};
use dirs_next::home_dir;

use super::settings::EnvSnapshot;

pub(crate) const CACHE_DIR_ENV: &str = "ARTSTORE_CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLocation {
    pub path: PathBuf,
    pub source: &'static str,
}

/// Determine the root directory of the content cache.
///
/// `ARTSTORE_CACHE_DIR` wins, then `$XDG_CACHE_HOME/artstore`, then
/// `~/.cache/artstore`.
pub(crate) fn resolve_cache_location(snapshot: &EnvSnapshot) -> Result<CacheLocation> {
    if let Some(override_path) = snapshot.var(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(CacheLocation {
            path: absolutize(PathBuf::from(override_path))?,
            source: CACHE_DIR_ENV,
        });
    }
    if let Some(xdg) = snapshot.var("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return Ok(CacheLocation {
            path: absolutize(PathBuf::from(xdg))?.join("artstore"),
            source: "XDG_CACHE_HOME/artstore",
        });
    }
    if let Some(home) = home_dir() {
        return Ok(CacheLocation {
            path: home.join(".cache").join("artstore"),
            source: "HOME/.cache/artstore",
        });
    }
    Ok(CacheLocation {
        path: std::env::temp_dir().join("artstore"),
        source: "default (temp dir)",
    })
}

fn absolutize(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()
            .context("failed to resolve relative cache directory")?
            .join(path))
    }
}
