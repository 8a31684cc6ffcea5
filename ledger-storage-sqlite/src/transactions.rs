//! Transactions and blocks

use crate::models::{
    AccountId, BlockId, BlockInfo, BlockRow, NewTransaction, TransactionExtra, TransactionId,
    TransactionRow, TxStatus,
};
use crate::schema::{placeholders, ScopedTx, Table, PARAM_CHUNK};
use crate::{Error, Result};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};

const SELECT_TX: &str = r#"
    SELECT t.id, t.hash, t.digest, t.network_id, t.ordinal, t.status, t.last_update,
           t.error_message, t.extra, b.id, b.hash, b.height, b.slot, b.block_time
    FROM transactions t LEFT JOIN blocks b ON b.id = t.block_id
"#;

/// Ids of every transaction touching an address owned by account `?1`
pub(crate) const ACCOUNT_TX_IDS: &str = r#"
    SELECT i.transaction_id FROM utxo_inputs i
        JOIN account_addresses aa ON aa.address_id = i.address_id WHERE aa.account_id = ?1
    UNION
    SELECT o.transaction_id FROM utxo_outputs o
        JOIN account_addresses aa ON aa.address_id = o.address_id WHERE aa.account_id = ?1
    UNION
    SELECT w.transaction_id FROM accounting_inputs w
        JOIN account_addresses aa ON aa.address_id = w.address_id WHERE aa.account_id = ?1
    UNION
    SELECT c.transaction_id FROM certificates c
        JOIN certificate_addresses ca ON ca.certificate_id = c.id
        JOIN account_addresses aa ON aa.address_id = ca.address_id WHERE aa.account_id = ?1
"#;

/// Raw columns of one transaction row
struct TxColumns {
    id: TransactionId,
    hash: String,
    digest: i64,
    network_id: i64,
    ordinal: Option<i64>,
    status: i32,
    last_update: i64,
    error_message: Option<String>,
    extra: Option<String>,
    block_id: Option<BlockId>,
    block_hash: Option<String>,
    height: Option<i64>,
    slot: Option<i64>,
    block_time: Option<i64>,
}

impl TxColumns {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            hash: row.get(1)?,
            digest: row.get(2)?,
            network_id: row.get(3)?,
            ordinal: row.get(4)?,
            status: row.get(5)?,
            last_update: row.get(6)?,
            error_message: row.get(7)?,
            extra: row.get(8)?,
            block_id: row.get(9)?,
            block_hash: row.get(10)?,
            height: row.get(11)?,
            slot: row.get(12)?,
            block_time: row.get(13)?,
        })
    }

    fn into_row(self) -> Result<TransactionRow> {
        let block = match (self.block_id, self.block_hash) {
            (Some(id), Some(hash)) => Some(BlockRow {
                id,
                info: BlockInfo {
                    hash,
                    height: self.height.unwrap_or_default() as u64,
                    slot: self.slot.unwrap_or_default() as u64,
                    time: self.block_time.unwrap_or_default(),
                },
            }),
            _ => None,
        };
        let extra = self
            .extra
            .as_deref()
            .map(serde_json::from_str::<TransactionExtra>)
            .transpose()?;
        Ok(TransactionRow {
            id: self.id,
            hash: self.hash,
            digest: self.digest,
            network_id: self.network_id,
            block,
            ordinal: self.ordinal.map(|o| o as u32),
            status: TxStatus::from_code(self.status)?,
            last_update: self.last_update,
            error_message: self.error_message,
            extra,
        })
    }
}

/// Transaction and block operations inside a scoped transaction
pub struct TransactionStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> TransactionStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[Table::Block, Table::Transaction, Table::AccountAddress];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// Id of `block`, inserting it if unknown
    pub fn upsert_block(&self, network_id: i64, block: &BlockInfo) -> Result<BlockId> {
        self.tx.require_write()?;
        let digest = self.tx.digest(&block.hash);
        let existing: Option<BlockId> = self
            .tx
            .query_row(
                "SELECT id FROM blocks WHERE network_id = ?1 AND digest = ?2 AND hash = ?3",
                params![network_id, digest, block.hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.tx.execute(
            r#"
            INSERT INTO blocks (network_id, digest, hash, height, slot, block_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                network_id,
                digest,
                block.hash,
                block.height as i64,
                block.slot as i64,
                block.time
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Delete blocks no transaction references
    pub fn delete_unreferenced_blocks(&self) -> Result<usize> {
        self.tx.require_write()?;
        let deleted = self.tx.execute(
            r#"
            DELETE FROM blocks WHERE id NOT IN (
                SELECT block_id FROM transactions WHERE block_id IS NOT NULL
            )
            "#,
            [],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, "Removed unreferenced blocks");
        }
        Ok(deleted)
    }

    /// Stored transactions among `hashes`, keyed by hash.
    ///
    /// With `within`, hits outside that id set are discarded.
    pub fn find_by_hashes(
        &self,
        network_id: i64,
        hashes: &[String],
        within: Option<&HashSet<TransactionId>>,
    ) -> Result<HashMap<String, TransactionRow>> {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let digests: Vec<i64> = wanted
            .iter()
            .map(|h| self.tx.digest(h))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut out = HashMap::new();
        for chunk in digests.chunks(PARAM_CHUNK) {
            let sql = format!(
                "{SELECT_TX} WHERE t.network_id = ? AND t.digest IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let bind = std::iter::once(network_id).chain(chunk.iter().copied());
            let rows = stmt.query_map(params_from_iter(bind), TxColumns::from_row)?;
            for row in rows {
                let columns = row?;
                if !wanted.contains(columns.hash.as_str()) {
                    continue;
                }
                if within.is_some_and(|ids| !ids.contains(&columns.id)) {
                    continue;
                }
                let tx = columns.into_row()?;
                out.insert(tx.hash.clone(), tx);
            }
        }
        Ok(out)
    }

    /// Transaction by id
    pub fn get(&self, id: TransactionId) -> Result<Option<TransactionRow>> {
        Ok(self.get_by_ids(&[id])?.into_iter().next())
    }

    /// Transaction by id; a missing row is stale state
    pub fn require(&self, id: TransactionId) -> Result<TransactionRow> {
        self.get(id)?
            .ok_or_else(|| Error::StaleState(format!("transaction {id} disappeared")))
    }

    /// Transactions for `ids`
    pub fn get_by_ids(&self, ids: &[TransactionId]) -> Result<Vec<TransactionRow>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                "{SELECT_TX} WHERE t.id IN ({}) ORDER BY t.id",
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), TxColumns::from_row)?;
            for row in rows {
                out.push(row?.into_row()?);
            }
        }
        Ok(out)
    }

    /// Insert a transaction
    pub fn insert(&self, new: &NewTransaction) -> Result<TransactionId> {
        self.tx.require_write()?;
        let extra = new.extra.as_ref().map(serde_json::to_string).transpose()?;
        self.tx.execute(
            r#"
            INSERT INTO transactions
                (network_id, digest, hash, block_id, ordinal, status, last_update, error_message, extra)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                new.network_id,
                self.tx.digest(&new.hash),
                new.hash,
                new.block_id,
                new.ordinal,
                new.status.code(),
                chrono::Utc::now().timestamp(),
                new.error_message,
                extra
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Rewrite the mutable fields of a stored transaction in place
    pub fn update(&self, id: TransactionId, new: &NewTransaction) -> Result<()> {
        self.tx.require_write()?;
        let extra = new.extra.as_ref().map(serde_json::to_string).transpose()?;
        let updated = self.tx.execute(
            r#"
            UPDATE transactions SET
                block_id = ?1, ordinal = ?2, status = ?3, last_update = ?4,
                error_message = ?5, extra = ?6
            WHERE id = ?7
            "#,
            params![
                new.block_id,
                new.ordinal,
                new.status.code(),
                chrono::Utc::now().timestamp(),
                new.error_message,
                extra,
                id
            ],
        )?;
        if updated == 0 {
            return Err(Error::StaleState(format!("transaction {id} disappeared")));
        }
        Ok(())
    }

    /// Force `status` on `ids`
    pub fn set_status(&self, ids: &[TransactionId], status: TxStatus) -> Result<usize> {
        self.tx.require_write()?;
        let now = chrono::Utc::now().timestamp();
        let mut updated = 0;
        for chunk in ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                "UPDATE transactions SET status = ?, last_update = ? WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let bind = [i64::from(status.code()), now]
                .into_iter()
                .chain(chunk.iter().copied());
            updated += self.tx.execute(&sql, params_from_iter(bind))?;
        }
        Ok(updated)
    }

    /// Ids of every transaction related to `account`
    pub fn ids_for_account(&self, account: AccountId) -> Result<HashSet<TransactionId>> {
        let mut stmt = self.tx.prepare(ACCOUNT_TX_IDS)?;
        let rows = stmt.query_map([account], |row| row.get::<_, TransactionId>(0))?;
        let ids = rows.collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Transactions of `account` in `status`
    pub fn with_status(&self, account: AccountId, status: TxStatus) -> Result<Vec<TransactionRow>> {
        let sql = format!(
            "{SELECT_TX} WHERE t.id IN ({ACCOUNT_TX_IDS}) AND t.status = ?2 ORDER BY t.id"
        );
        self.query(&sql, params![account, status.code()])
    }

    /// Confirmed transactions of `account` in blocks at or above `height`
    pub fn confirmed_from_height(&self, account: AccountId, height: u64) -> Result<Vec<TransactionRow>> {
        let sql = format!(
            r#"{SELECT_TX} WHERE t.id IN ({ACCOUNT_TX_IDS})
                AND t.status = ?2 AND b.height >= ?3
                ORDER BY b.height, t.ordinal"#
        );
        self.query(&sql, params![account, TxStatus::InBlock.code(), height as i64])
    }

    /// Highest confirmed transaction of `account`, optionally strictly below `height`
    pub fn best_confirmed(&self, account: AccountId, below: Option<u64>) -> Result<Option<TransactionRow>> {
        let limit = below.map_or(i64::MAX, |h| h as i64);
        let sql = format!(
            r#"{SELECT_TX} WHERE t.id IN ({ACCOUNT_TX_IDS})
                AND t.status = ?2 AND b.height < ?3
                ORDER BY b.height DESC, t.ordinal DESC LIMIT 1"#
        );
        Ok(self
            .query(&sql, params![account, TxStatus::InBlock.code(), limit])?
            .into_iter()
            .next())
    }

    /// One page of the history of `account`.
    ///
    /// Unconfirmed transactions come first, then confirmed ones from the
    /// newest block down.
    pub fn history_page(&self, account: AccountId, skip: usize, limit: usize) -> Result<Vec<TransactionRow>> {
        let sql = format!(
            r#"{SELECT_TX} WHERE t.id IN ({ACCOUNT_TX_IDS})
                ORDER BY (t.block_id IS NULL) DESC, b.height DESC, t.ordinal DESC, t.id DESC
                LIMIT ?2 OFFSET ?3"#
        );
        self.query(&sql, params![account, limit as i64, skip as i64])
    }

    /// Delete `ids` (inputs, outputs and certificates cascade)
    pub fn delete(&self, ids: &[TransactionId]) -> Result<usize> {
        self.tx.require_write()?;
        let mut deleted = 0;
        for chunk in ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                "DELETE FROM transactions WHERE id IN ({})",
                placeholders(chunk.len())
            );
            deleted += self.tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        Ok(deleted)
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<TransactionRow>> {
        let mut stmt = self.tx.prepare(sql)?;
        let rows = stmt.query_map(params, TxColumns::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_row()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LockSet;
    use crate::Database;

    fn new_tx(hash: &str, block_id: Option<BlockId>, status: TxStatus) -> NewTransaction {
        NewTransaction {
            hash: hash.to_string(),
            network_id: 1,
            block_id,
            ordinal: block_id.map(|_| 0),
            status,
            error_message: None,
            extra: Some(TransactionExtra::Cardano {
                fee: "170000".to_string(),
                is_valid: true,
            }),
        }
    }

    fn block(height: u64) -> BlockInfo {
        BlockInfo {
            hash: format!("{height:064x}"),
            height,
            slot: height * 20,
            time: 1_600_000_000 + height as i64,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(TransactionStore::TABLES)).unwrap();
        let store = TransactionStore::new(&tx).unwrap();
        let block_id = store.upsert_block(1, &block(100)).unwrap();
        assert_eq!(store.upsert_block(1, &block(100)).unwrap(), block_id);

        let id = store
            .insert(&new_tx("aa", Some(block_id), TxStatus::InBlock))
            .unwrap();
        let found = store
            .find_by_hashes(1, &["aa".to_string(), "bb".to_string()], None)
            .unwrap();
        assert_eq!(found.len(), 1);
        let row = &found["aa"];
        assert_eq!(row.id, id);
        assert_eq!(row.height(), Some(100));
        assert_eq!(row.status, TxStatus::InBlock);

        let restricted = store
            .find_by_hashes(1, &["aa".to_string()], Some(&HashSet::new()))
            .unwrap();
        assert!(restricted.is_empty());
        let other_network = store.find_by_hashes(250, &["aa".to_string()], None).unwrap();
        assert!(other_network.is_empty());
    }

    #[test]
    fn test_update_keeps_id() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(TransactionStore::TABLES)).unwrap();
        let store = TransactionStore::new(&tx).unwrap();
        let id = store.insert(&new_tx("aa", None, TxStatus::Pending)).unwrap();
        let block_id = store.upsert_block(1, &block(7)).unwrap();
        store
            .update(id, &new_tx("aa", Some(block_id), TxStatus::InBlock))
            .unwrap();
        let row = store.require(id).unwrap();
        assert_eq!(row.status, TxStatus::InBlock);
        assert_eq!(row.height(), Some(7));
        assert!(matches!(
            store.update(id + 10, &new_tx("zz", None, TxStatus::Pending)),
            Err(Error::StaleState(_))
        ));
    }

    #[test]
    fn test_block_gc() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(TransactionStore::TABLES)).unwrap();
        let store = TransactionStore::new(&tx).unwrap();
        let used = store.upsert_block(1, &block(1)).unwrap();
        store.upsert_block(1, &block(2)).unwrap();
        store.insert(&new_tx("aa", Some(used), TxStatus::InBlock)).unwrap();
        assert_eq!(store.delete_unreferenced_blocks().unwrap(), 1);
    }

    #[test]
    fn test_set_status() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(TransactionStore::TABLES)).unwrap();
        let store = TransactionStore::new(&tx).unwrap();
        let a = store.insert(&new_tx("aa", None, TxStatus::Pending)).unwrap();
        let b = store.insert(&new_tx("bb", None, TxStatus::Pending)).unwrap();
        assert_eq!(store.set_status(&[a, b], TxStatus::NotInRemote).unwrap(), 2);
        assert!(store
            .get_by_ids(&[a, b])
            .unwrap()
            .iter()
            .all(|t| t.status == TxStatus::NotInRemote));
    }
}
