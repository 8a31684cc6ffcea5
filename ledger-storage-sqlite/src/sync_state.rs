//! Per-account sync anchor with retry/backoff for SQLITE_BUSY
//!
//! `last_sync_info` holds the last confirmed block each account was synced
//! to. It is the rollback anchor: a divergence is detected against it and a
//! rollback rewinds it.

use crate::models::{AccountId, LastSyncInfo};
use crate::schema::{ScopedTx, Table};
use crate::{Database, Error, Result};
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for SQLITE_BUSY
pub const MAX_BUSY_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds
pub const BASE_BACKOFF_MS: u64 = 50;

/// Maximum backoff duration in milliseconds
pub const MAX_BACKOFF_MS: u64 = 1000;

/// Sync anchor operations inside a scoped transaction
pub struct LastSyncStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> LastSyncStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[Table::LastSyncInfo];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// Anchor of `account` (empty if the account never synced)
    pub fn get(&self, account: AccountId) -> Result<LastSyncInfo> {
        Ok(read_last_sync(self.tx, account)?.unwrap_or_default())
    }

    /// Replace the anchor of `account`
    pub fn set(&self, account: AccountId, info: &LastSyncInfo) -> Result<()> {
        self.tx.require_write()?;
        let updated_at = chrono::Utc::now().to_rfc3339();
        self.tx.execute(
            r#"
            INSERT INTO last_sync_info (account_id, block_hash, height, slot, block_time, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(account_id) DO UPDATE SET
                block_hash = excluded.block_hash,
                height = excluded.height,
                slot = excluded.slot,
                block_time = excluded.block_time,
                updated_at = excluded.updated_at
            "#,
            params![
                account,
                info.block_hash,
                info.height as i64,
                info.slot.map(|s| s as i64),
                info.time,
                updated_at
            ],
        )?;
        tracing::debug!(
            account,
            height = info.height,
            "Updated last sync info"
        );
        Ok(())
    }

    /// Reset the anchor of `account` to the empty state
    pub fn clear(&self, account: AccountId) -> Result<()> {
        self.set(account, &LastSyncInfo::default())
    }
}

/// Sync anchor reads outside any scoped transaction, retried on SQLITE_BUSY.
///
/// Used to observe the anchor before a write lock is requested, e.g. to
/// detect concurrent progress during a rollback.
pub struct SyncStateStorage<'a> {
    db: &'a Database,
}

impl<'a> SyncStateStorage<'a> {
    /// Create new sync state storage
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Load the anchor of `account`
    pub fn load_last_sync(&self, account: AccountId) -> Result<LastSyncInfo> {
        with_busy_retry(|| Ok(read_last_sync(self.db.conn(), account)?.unwrap_or_default()))
    }
}

fn read_last_sync(conn: &rusqlite::Connection, account: AccountId) -> Result<Option<LastSyncInfo>> {
    let row = conn
        .query_row(
            "SELECT block_hash, height, slot, block_time FROM last_sync_info WHERE account_id = ?1",
            [account],
            |row| {
                Ok(LastSyncInfo {
                    block_hash: row.get(0)?,
                    height: row.get::<_, i64>(1)? as u64,
                    slot: row.get::<_, Option<i64>>(2)?.map(|s| s as u64),
                    time: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Run `f`, retrying with exponential backoff while SQLite reports busy
pub fn with_busy_retry<F, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts = 0;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(Error::Database(ref e)) if is_busy_error(e) && attempts < MAX_BUSY_RETRIES => {
                attempts += 1;
                let backoff = calculate_backoff(attempts);
                tracing::debug!(
                    "SQLITE_BUSY (attempt {}/{}), retrying in {}ms",
                    attempts,
                    MAX_BUSY_RETRIES,
                    backoff
                );
                thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if error is SQLITE_BUSY
fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: ErrorCode::DatabaseBusy,
                ..
            },
            _
        )
    )
}

/// Calculate exponential backoff with jitter
fn calculate_backoff(attempt: u32) -> u64 {
    let base = BASE_BACKOFF_MS * (1 << attempt.min(6));
    let jitter = rand::random::<u64>() % (base / 4 + 1);
    (base + jitter).min(MAX_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::models::{BlockInfo, WalletKind};
    use crate::schema::LockSet;
    use tempfile::NamedTempFile;

    fn test_db() -> (NamedTempFile, Database) {
        let file = NamedTempFile::new().unwrap();
        let db = Database::open(file.path()).unwrap();
        (file, db)
    }

    fn create_account(db: &Database) -> AccountId {
        let tx = db.write(LockSet::of(AccountStore::TABLES)).unwrap();
        let account = AccountStore::new(&tx)
            .unwrap()
            .create("main", 1, WalletKind::Utxo)
            .unwrap();
        tx.commit().unwrap();
        account.id
    }

    #[test]
    fn test_save_and_load_last_sync() {
        let (_file, db) = test_db();
        let account = create_account(&db);
        let block = BlockInfo {
            hash: "aa".repeat(32),
            height: 1000,
            slot: 5000,
            time: 1_700_000_000,
        };

        let tx = db.write(LockSet::of(LastSyncStore::TABLES)).unwrap();
        LastSyncStore::new(&tx)
            .unwrap()
            .set(account, &LastSyncInfo::at(&block))
            .unwrap();
        tx.commit().unwrap();

        let state = SyncStateStorage::new(&db).load_last_sync(account).unwrap();
        assert_eq!(state.height, 1000);
        assert_eq!(state.slot, Some(5000));
        assert_eq!(state.block_hash.as_deref(), Some(block.hash.as_str()));
    }

    #[test]
    fn test_new_account_has_empty_anchor() {
        let (_file, db) = test_db();
        let account = create_account(&db);
        let state = SyncStateStorage::new(&db).load_last_sync(account).unwrap();
        assert!(state.is_empty());
        assert_eq!(state.height, 0);
    }

    #[test]
    fn test_clear_last_sync() {
        let (_file, db) = test_db();
        let account = create_account(&db);
        let tx = db.write(LockSet::of(LastSyncStore::TABLES)).unwrap();
        let store = LastSyncStore::new(&tx).unwrap();
        store
            .set(
                account,
                &LastSyncInfo {
                    block_hash: Some("bb".to_string()),
                    height: 12,
                    slot: Some(40),
                    time: Some(1),
                },
            )
            .unwrap();
        store.clear(account).unwrap();
        assert!(store.get(account).unwrap().is_empty());
    }

    #[test]
    fn test_set_requires_write_mode() {
        let (_file, db) = test_db();
        let account = create_account(&db);
        let tx = db.read(LockSet::of(LastSyncStore::TABLES)).unwrap();
        let store = LastSyncStore::new(&tx).unwrap();
        assert!(store.clear(account).is_err());
    }

    #[test]
    fn test_backoff_bounds() {
        for attempt in 1..=MAX_BUSY_RETRIES {
            let backoff = calculate_backoff(attempt);
            assert!(backoff >= BASE_BACKOFF_MS);
            assert!(backoff <= MAX_BACKOFF_MS);
        }
    }
}
