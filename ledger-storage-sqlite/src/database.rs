//! Database connection and initialization

use crate::schema::{LockSet, ScopedTx, TxMode};
use crate::sync_state::with_busy_retry;
use crate::{digest, migrations, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;

/// Milliseconds SQLite itself waits on a locked database before reporting busy
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Database connection wrapper
pub struct Database {
    conn: Connection,
    digest_seed: u32,
}

impl Database {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // journal_mode returns the resulting mode as a row
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        tracing::debug!("Opened store at {:?} (journal_mode={})", path.as_ref(), mode);

        Self::init(conn)
    }

    /// Open a private in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;

        migrations::run_migrations(&conn)?;
        let digest_seed = load_or_create_seed(&conn)?;

        Ok(Self { conn, digest_seed })
    }

    /// Get connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Per-install digest seed
    pub fn digest_seed(&self) -> u32 {
        self.digest_seed
    }

    /// Digest of `value` under this install's seed
    pub fn digest(&self, value: &str) -> i64 {
        digest::digest(self.digest_seed, value)
    }

    /// Begin a transaction scoped to `locks`.
    ///
    /// Write transactions take the database write lock immediately; a busy
    /// database is retried with backoff.
    pub fn begin(&self, mode: TxMode, locks: LockSet) -> Result<ScopedTx<'_>> {
        with_busy_retry(|| ScopedTx::begin(&self.conn, mode, locks, self.digest_seed))
    }

    /// Read-only transaction scoped to `locks`
    pub fn read(&self, locks: LockSet) -> Result<ScopedTx<'_>> {
        self.begin(TxMode::Read, locks)
    }

    /// Write transaction scoped to `locks`
    pub fn write(&self, locks: LockSet) -> Result<ScopedTx<'_>> {
        self.begin(TxMode::Write, locks)
    }
}

fn load_or_create_seed(conn: &Connection) -> Result<u32> {
    let existing: Option<i64> = conn
        .query_row("SELECT digest_seed FROM store_meta WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    if let Some(seed) = existing {
        return Ok(seed as u32);
    }

    let seed: u32 = rand::random();
    conn.execute(
        "INSERT INTO store_meta (id, digest_seed, created_at) VALUES (1, ?1, ?2)",
        params![i64::from(seed), chrono::Utc::now().timestamp()],
    )?;
    tracing::debug!("Generated digest seed for new store");
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Table;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_database() {
        let file = NamedTempFile::new().unwrap();
        let result = Database::open(file.path());
        assert!(result.is_ok());
    }

    #[test]
    fn test_seed_survives_reopen() {
        let file = NamedTempFile::new().unwrap();
        let seed = Database::open(file.path()).unwrap().digest_seed();
        let reopened = Database::open(file.path()).unwrap();
        assert_eq!(reopened.digest_seed(), seed);
        assert_eq!(reopened.digest("abc"), digest::digest(seed, "abc"));
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = Database::open_in_memory().unwrap();
        let enabled: i64 = db
            .conn()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_nested_begin_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let _outer = db.read(LockSet::of(&[Table::Address])).unwrap();
        assert!(db.read(LockSet::of(&[Table::Address])).is_err());
    }

    #[test]
    fn test_scoped_tx_rejects_foreign_table() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.read(LockSet::of(&[Table::Token])).unwrap();
        assert!(tx.ensure(&[Table::TokenList]).is_ok());
        assert!(matches!(
            tx.ensure(&[Table::Transaction]),
            Err(crate::Error::LockViolation("transactions"))
        ));
        assert!(tx.require_write().is_err());
    }
}
