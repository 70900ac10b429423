use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use artstore_domain::{ArtifactError, Entry};

use super::{lock, ManifestStore};

/// First engine release with `INSERT ... ON CONFLICT DO UPDATE`.
pub(crate) const MIN_SQLITE_VERSION: i32 = 3_024_000;
pub(crate) const DEFAULT_MAX_BUFFER_SIZE: usize = 10_000;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS manifest_entries (
        path TEXT NOT NULL PRIMARY KEY,
        ref TEXT,
        digest TEXT NOT NULL,
        birth_artifact_id TEXT,
        size INTEGER,
        extra TEXT,
        local_path TEXT
    );
";

// Same-digest inserts refresh the row; a differing digest changes nothing.
const UPSERT: &str = "INSERT INTO manifest_entries
        (path, ref, digest, birth_artifact_id, size, extra, local_path)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(path) DO UPDATE SET
        ref = excluded.ref,
        birth_artifact_id = COALESCE(excluded.birth_artifact_id, manifest_entries.birth_artifact_id),
        size = excluded.size,
        extra = excluded.extra,
        local_path = excluded.local_path
     WHERE manifest_entries.digest = excluded.digest";

const COLUMNS: &str = "path, ref, digest, birth_artifact_id, size, extra, local_path";

/// Version of the linked SQLite engine as `(number, display)`.
pub(crate) fn engine_version() -> (i32, &'static str) {
    (rusqlite::version_number(), rusqlite::version())
}

pub(crate) fn engine_supported() -> bool {
    engine_version().0 >= MIN_SQLITE_VERSION
}

struct PooledConnection {
    conn: Connection,
    in_tx: bool,
    pending: usize,
}

/// Manifest rows in an on-disk SQLite database.
///
/// Connections are not shared across threads: each calling thread gets its
/// own, created on first use and closed together by [`ManifestStore::close`].
pub(crate) struct SqliteStore {
    path: PathBuf,
    pool: Mutex<HashMap<ThreadId, Arc<Mutex<PooledConnection>>>>,
    max_buffer_size: usize,
}

impl SqliteStore {
    pub(crate) fn open(path: PathBuf, max_buffer_size: usize) -> Result<Self> {
        let (number, display) = engine_version();
        if number < MIN_SQLITE_VERSION {
            return Err(ArtifactError::UnsupportedEngineVersion {
                required: "3.24.0".into(),
                found: display.into(),
            }
            .into());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create manifest directory {}", parent.display())
            })?;
        }
        let store = Self {
            path,
            pool: Mutex::new(HashMap::new()),
            max_buffer_size: max_buffer_size.max(1),
        };
        let handle = store.connection()?;
        lock(&handle)?
            .conn
            .execute_batch(SCHEMA)
            .context("failed to initialize manifest schema")?;
        Ok(store)
    }

    fn connection(&self) -> Result<Arc<Mutex<PooledConnection>>> {
        let id = thread::current().id();
        let mut pool = lock(&self.pool)?;
        if let Some(existing) = pool.get(&id) {
            return Ok(Arc::clone(existing));
        }
        let conn = self.open_connection()?;
        let handle = Arc::new(Mutex::new(PooledConnection {
            conn,
            in_tx: false,
            pending: 0,
        }));
        pool.insert(id, Arc::clone(&handle));
        debug!(path = %self.path.display(), ?id, "opened manifest connection");
        Ok(handle)
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open manifest at {}", self.path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for manifest")?;
        conn.pragma_update(None, "synchronous", "OFF")
            .context("failed to relax manifest sync mode")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for manifest")?;
        Ok(conn)
    }

    fn existing_digest(conn: &Connection, path: &str) -> Result<String> {
        let digest: Option<String> = conn
            .query_row(
                "SELECT digest FROM manifest_entries WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(digest.unwrap_or_default())
    }

    fn commit(pooled: &mut PooledConnection) -> Result<()> {
        if pooled.in_tx {
            pooled
                .conn
                .execute_batch("COMMIT")
                .context("failed to commit manifest writes")?;
            pooled.in_tx = false;
        }
        pooled.pending = 0;
        Ok(())
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let path: String = row.get(0)?;
    let reference: Option<String> = row.get(1)?;
    let digest: String = row.get(2)?;
    let birth_artifact_id: Option<String> = row.get(3)?;
    let size: Option<i64> = row.get(4)?;
    let extra: Option<String> = row.get(5)?;
    let local_path: Option<String> = row.get(6)?;

    let extra: BTreeMap<String, String> = match extra {
        Some(raw) => serde_json::from_str(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
        })?,
        None => BTreeMap::new(),
    };
    let size = size.and_then(|value| u64::try_from(value).ok());
    let mut entry = Entry::new(path, digest)
        .with_size(size)
        .with_extra(extra)
        .with_birth_artifact_id(birth_artifact_id);
    entry.reference = reference;
    if let Some(local_path) = local_path {
        entry.set_local_path(local_path, size.unwrap_or(0));
    }
    Ok(entry)
}

impl ManifestStore for SqliteStore {
    fn upsert(&self, entry: &Entry, buffered: bool) -> Result<()> {
        let handle = self.connection()?;
        let mut pooled = lock(&handle)?;
        if buffered && !pooled.in_tx {
            pooled
                .conn
                .execute_batch("BEGIN")
                .context("failed to begin manifest transaction")?;
            pooled.in_tx = true;
        }
        let extra = if entry.extra.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&entry.extra)?)
        };
        let size = entry.size.map(i64::try_from).transpose()?;
        let local_path = entry
            .local_path()
            .map(|path| path.to_string_lossy().into_owned());
        let changed = pooled
            .conn
            .execute(
                UPSERT,
                params![
                    entry.path,
                    entry.reference,
                    entry.digest,
                    entry.birth_artifact_id,
                    size,
                    extra,
                    local_path,
                ],
            )
            .with_context(|| format!("failed to record manifest entry {}", entry.path))?;
        if changed == 0 {
            let existing = Self::existing_digest(&pooled.conn, &entry.path)?;
            return Err(ArtifactError::PathConflict {
                path: entry.path.clone(),
                existing,
                attempted: entry.digest.clone(),
            }
            .into());
        }
        if pooled.in_tx {
            pooled.pending += 1;
            if !buffered || pooled.pending >= self.max_buffer_size {
                Self::commit(&mut pooled)?;
            }
        }
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Entry>> {
        let handle = self.connection()?;
        let pooled = lock(&handle)?;
        let sql = format!("SELECT {COLUMNS} FROM manifest_entries WHERE path = ?1");
        Ok(pooled
            .conn
            .query_row(&sql, params![path], row_to_entry)
            .optional()?)
    }

    fn page(&self, prefix: &str, after: Option<&str>, limit: usize) -> Result<Vec<Entry>> {
        let handle = self.connection()?;
        let pooled = lock(&handle)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM manifest_entries
             WHERE substr(path, 1, length(?1)) = ?1
               AND (?2 IS NULL OR path > ?2)
             ORDER BY path
             LIMIT ?3"
        );
        let mut stmt = pooled.conn.prepare_cached(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![prefix, after, limit], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn set_birth_artifact_id(&self, path: &str, birth_artifact_id: &str) -> Result<bool> {
        let handle = self.connection()?;
        let pooled = lock(&handle)?;
        let changed = pooled.conn.execute(
            "UPDATE manifest_entries SET birth_artifact_id = ?2 WHERE path = ?1",
            params![path, birth_artifact_id],
        )?;
        Ok(changed > 0)
    }

    fn len(&self) -> Result<usize> {
        let handle = self.connection()?;
        let pooled = lock(&handle)?;
        let count: i64 =
            pooled
                .conn
                .query_row("SELECT COUNT(*) FROM manifest_entries", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn total_size(&self) -> Result<u64> {
        let handle = self.connection()?;
        let pooled = lock(&handle)?;
        let total: i64 = pooled.conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM manifest_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn flush(&self) -> Result<()> {
        let handles: Vec<_> = lock(&self.pool)?.values().cloned().collect();
        for handle in handles {
            Self::commit(&mut *lock(&handle)?)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.flush()?;
        let drained: Vec<_> = lock(&self.pool)?.drain().map(|(_, handle)| handle).collect();
        debug!(path = %self.path.display(), connections = drained.len(), "closing manifest connections");
        Ok(())
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
