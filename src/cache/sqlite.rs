use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::create_dir_all;
use std::path::Path;
use std::path::PathBuf;

use rusqlite::params;
use rusqlite::Connection;

use crate::log::debug;
use crate::log::warn;
use crate::Error;
use crate::ErrorExt as _;
use crate::Mode;
use crate::Result;
use crate::SymbolInfo;

use super::CacheKey;
use super::CacheStore;


const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS symbols (
  orig_elf TEXT NOT NULL,
  offset   TEXT NOT NULL,
  mode     TEXT NOT NULL,
  frames   TEXT NOT NULL,
  PRIMARY KEY (orig_elf, offset, mode)
);
";


/// A [`CacheStore`] backed by an SQLite database file.
///
/// Every row holds the symbolization result for one
/// `(object path, offset, mode)` triple, with the result encoded as a
/// JSON list of `[function, location]` pairs.
pub struct SqliteStore {
    /// The path of the database file, for reporting purposes.
    path: PathBuf,
    conn: Connection,
}

impl SqliteStore {
    /// Open (and create, if necessary) the database at `path`.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                let () = create_dir_all(dir)
                    .with_context(|| format!("failed to create directory {}", dir.display()))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(Error::from)
            .with_context(|| format!("failed to open cache database {}", path.display()))?;
        Self::with_connection(path.to_path_buf(), conn)
    }

    /// Create a store backed by an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(PathBuf::from(":memory:"), conn)
    }

    fn with_connection(path: PathBuf, conn: Connection) -> Result<Self> {
        let () = conn
            .execute_batch(SCHEMA)
            .map_err(Error::from)
            .context("failed to create cache schema")?;
        Ok(Self { path, conn })
    }

    /// Retrieve the path of the database file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStore for SqliteStore {
    fn load(&self, mode: Mode) -> Result<HashMap<CacheKey, SymbolInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT orig_elf, offset, frames FROM symbols WHERE mode = ?1")?;
        let rows = stmt.query_map(params![mode.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = HashMap::new();
        for row in rows {
            let (orig_elf, offset, frames) = row?;
            let info = match serde_json::from_str::<SymbolInfo>(&frames) {
                Ok(info) => info,
                Err(err) => {
                    warn!("malformed cache entry for {orig_elf}+{offset}: {err}");
                    SymbolInfo::unknown()
                }
            };
            let _prev = entries.insert(CacheKey::new(orig_elf, &offset), info);
        }

        debug!(
            "loaded {} {mode} entries from {}",
            entries.len(),
            self.path.display()
        );
        Ok(entries)
    }

    fn save(&mut self, mode: Mode, entries: &HashMap<CacheKey, SymbolInfo>) -> Result<()> {
        if entries.is_empty() {
            return Ok(())
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO symbols (orig_elf, offset, mode, frames)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (key, info) in entries {
                let frames = serde_json::to_string(info).map_err(Error::with_invalid_data)?;
                let _count =
                    stmt.execute(params![key.object_path, key.offset, mode.as_str(), frames])?;
            }
        }
        let () = tx.commit()?;

        debug!(
            "stored {} {mode} entries in {}",
            entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish()
    }
}
