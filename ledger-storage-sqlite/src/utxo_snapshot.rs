//! UTXO safe-point snapshot and diff chain
//!
//! The safe point is the full UTXO set of an account as of a final block.
//! Diffs layered on top, in insertion order, bring it up to the best block:
//! `safe_point ⊕ diff_1 ⊕ ... ⊕ diff_n` is the current set.

use crate::models::{AccountId, SafePoint, UtxoDiff, UtxoEntry};
use crate::schema::{ScopedTx, Table};
use crate::Result;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Snapshot operations for one account inside a scoped transaction
pub struct UtxoSnapshotStore<'a> {
    tx: &'a ScopedTx<'a>,
    account: AccountId,
}

impl<'a> UtxoSnapshotStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[Table::UtxoAtSafePoint, Table::UtxoDiffToBestBlock];

    /// Bind to `tx` for `account`
    pub fn new(tx: &'a ScopedTx<'a>, account: AccountId) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx, account })
    }

    /// Stored safe point, if any
    pub fn get_safe_point(&self) -> Result<Option<SafePoint>> {
        let row = self
            .tx
            .query_row(
                r#"
                SELECT block_hash, block_height, address_set_hash, utxos
                FROM utxo_at_safe_point WHERE account_id = ?1
                "#,
                [self.account],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(block_hash, block_height, address_set_hash, utxos)| {
            Ok(SafePoint {
                block_hash,
                block_height: block_height as u64,
                address_set_hash,
                utxos: serde_json::from_str(&utxos)?,
            })
        })
        .transpose()
    }

    /// Diffs in application order
    pub fn get_diff_chain(&self) -> Result<Vec<UtxoDiff>> {
        let mut stmt = self.tx.prepare(
            r#"
            SELECT last_best_block_hash, block_height, spent_utxo_ids, new_utxos
            FROM utxo_diff_to_best_block WHERE account_id = ?1 ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([self.account], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (last_best_block_hash, block_height, spent, new) = row?;
            out.push(UtxoDiff {
                last_best_block_hash,
                block_height: block_height as u64,
                spent_utxo_ids: serde_json::from_str(&spent)?,
                new_utxos: serde_json::from_str(&new)?,
            });
        }
        Ok(out)
    }

    /// Replace the safe point and drop the diffs it already covers
    pub fn replace_safe_point(&self, safe_point: &SafePoint) -> Result<()> {
        self.tx.require_write()?;
        self.tx.execute(
            r#"
            INSERT INTO utxo_at_safe_point (account_id, block_hash, block_height, address_set_hash, utxos)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id) DO UPDATE SET
                block_hash = excluded.block_hash,
                block_height = excluded.block_height,
                address_set_hash = excluded.address_set_hash,
                utxos = excluded.utxos
            "#,
            params![
                self.account,
                safe_point.block_hash,
                safe_point.block_height as i64,
                safe_point.address_set_hash,
                serde_json::to_string(&safe_point.utxos)?
            ],
        )?;
        let dropped = self.tx.execute(
            "DELETE FROM utxo_diff_to_best_block WHERE account_id = ?1 AND block_height <= ?2",
            params![self.account, safe_point.block_height as i64],
        )?;
        tracing::debug!(
            account = self.account,
            height = safe_point.block_height,
            utxos = safe_point.utxos.len(),
            dropped,
            "Replaced UTXO safe point"
        );
        Ok(())
    }

    /// Append `diff` to the chain.
    ///
    /// A diff for a block hash already in the chain is folded into the
    /// existing entry, keeping one entry per block hash. When that entry is
    /// not the tail, the diffs after it are folded in first and removed, so
    /// the entry becomes the tail and application order is preserved.
    pub fn append_diff(&self, diff: &UtxoDiff) -> Result<()> {
        self.tx.require_write()?;
        let chain = self.get_diff_chain()?;
        let position = chain
            .iter()
            .position(|d| d.last_best_block_hash == diff.last_best_block_hash);
        let merged = match position {
            Some(pos) => {
                let mut merged = chain[pos].clone();
                for later in &chain[pos + 1..] {
                    apply_diff_to_diff(&mut merged, later);
                    self.remove_diff(&later.last_best_block_hash)?;
                }
                apply_diff_to_diff(&mut merged, diff);
                merged
            }
            None => diff.clone(),
        };
        self.tx.execute(
            r#"
            INSERT INTO utxo_diff_to_best_block
                (account_id, last_best_block_hash, block_height, spent_utxo_ids, new_utxos)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id, last_best_block_hash) DO UPDATE SET
                block_height = excluded.block_height,
                spent_utxo_ids = excluded.spent_utxo_ids,
                new_utxos = excluded.new_utxos
            "#,
            params![
                self.account,
                merged.last_best_block_hash,
                merged.block_height as i64,
                serde_json::to_string(&merged.spent_utxo_ids)?,
                serde_json::to_string(&merged.new_utxos)?
            ],
        )?;
        Ok(())
    }

    /// Remove the diff for `block_hash`
    pub fn remove_diff(&self, block_hash: &str) -> Result<bool> {
        self.tx.require_write()?;
        let deleted = self.tx.execute(
            "DELETE FROM utxo_diff_to_best_block WHERE account_id = ?1 AND last_best_block_hash = ?2",
            params![self.account, block_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Remove every diff for a block above `height`
    pub fn remove_diffs_above(&self, height: u64) -> Result<usize> {
        self.tx.require_write()?;
        let deleted = self.tx.execute(
            "DELETE FROM utxo_diff_to_best_block WHERE account_id = ?1 AND block_height > ?2",
            params![self.account, height as i64],
        )?;
        Ok(deleted)
    }

    /// Drop the safe point and every diff
    pub fn clear(&self) -> Result<()> {
        self.tx.require_write()?;
        self.tx.execute(
            "DELETE FROM utxo_at_safe_point WHERE account_id = ?1",
            [self.account],
        )?;
        self.tx.execute(
            "DELETE FROM utxo_diff_to_best_block WHERE account_id = ?1",
            [self.account],
        )?;
        tracing::debug!(account = self.account, "Cleared UTXO snapshot");
        Ok(())
    }

    /// Safe point with the whole diff chain applied, keyed by utxo id
    pub fn current_set(&self) -> Result<BTreeMap<String, UtxoEntry>> {
        let mut set: BTreeMap<String, UtxoEntry> = self
            .get_safe_point()?
            .map(|sp| sp.utxos)
            .unwrap_or_default()
            .into_iter()
            .map(|u| (u.utxo_id.clone(), u))
            .collect();
        for diff in self.get_diff_chain()? {
            apply_diff(&mut set, &diff);
        }
        Ok(set)
    }
}

/// Apply `diff` to a UTXO set
pub fn apply_diff(set: &mut BTreeMap<String, UtxoEntry>, diff: &UtxoDiff) {
    for id in &diff.spent_utxo_ids {
        set.remove(id);
    }
    for utxo in &diff.new_utxos {
        set.insert(utxo.utxo_id.clone(), utxo.clone());
    }
}

/// Fold `next` into `prior` so that applying the result equals applying both
fn apply_diff_to_diff(prior: &mut UtxoDiff, next: &UtxoDiff) {
    let spent_now: HashSet<&str> = next.spent_utxo_ids.iter().map(String::as_str).collect();
    let added_before: HashSet<String> = prior.new_utxos.iter().map(|u| u.utxo_id.clone()).collect();

    prior.new_utxos.retain(|u| !spent_now.contains(u.utxo_id.as_str()));
    for id in &next.spent_utxo_ids {
        if !added_before.contains(id) && !prior.spent_utxo_ids.contains(id) {
            prior.spent_utxo_ids.push(id.clone());
        }
    }
    for utxo in &next.new_utxos {
        prior.new_utxos.retain(|u| u.utxo_id != utxo.utxo_id);
        prior.new_utxos.push(utxo.clone());
    }
    prior.block_height = next.block_height;
}

/// Hash identifying an address universe; order and duplicates do not matter
pub fn address_set_hash<S: AsRef<str>>(addresses: &[S]) -> String {
    let mut sorted: Vec<&str> = addresses.iter().map(|a| a.as_ref()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for address in sorted {
        hasher.update(address.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(tx: &str, index: u32, amount: u64) -> UtxoEntry {
        UtxoEntry {
            utxo_id: UtxoEntry::make_id(tx, index),
            tx_hash: tx.to_string(),
            tx_index: index,
            receiver: "addr".to_string(),
            amount: amount.to_string(),
            assets: Vec::new(),
            block_height: 1,
        }
    }

    #[test]
    fn test_address_set_hash_ignores_order() {
        assert_eq!(
            address_set_hash(&["b", "a", "a"]),
            address_set_hash(&["a", "b"])
        );
        assert_ne!(address_set_hash(&["a", "b"]), address_set_hash(&["a"]));
        // Separator keeps concatenations apart.
        assert_ne!(address_set_hash(&["ab", "c"]), address_set_hash(&["a", "bc"]));
    }

    #[test]
    fn test_fold_diffs_matches_sequential_application() {
        let base: BTreeMap<String, UtxoEntry> = [utxo("aa", 0, 5), utxo("bb", 1, 6)]
            .into_iter()
            .map(|u| (u.utxo_id.clone(), u))
            .collect();
        let first = UtxoDiff {
            last_best_block_hash: "h".to_string(),
            block_height: 10,
            spent_utxo_ids: vec![UtxoEntry::make_id("aa", 0)],
            new_utxos: vec![utxo("cc", 0, 4)],
        };
        let second = UtxoDiff {
            last_best_block_hash: "h".to_string(),
            block_height: 11,
            spent_utxo_ids: vec![UtxoEntry::make_id("cc", 0), UtxoEntry::make_id("bb", 1)],
            new_utxos: vec![utxo("dd", 0, 3)],
        };

        let mut sequential = base.clone();
        apply_diff(&mut sequential, &first);
        apply_diff(&mut sequential, &second);

        let mut folded = first.clone();
        apply_diff_to_diff(&mut folded, &second);
        let mut combined = base;
        apply_diff(&mut combined, &folded);

        assert_eq!(sequential, combined);
        assert_eq!(folded.block_height, 11);
    }

    #[test]
    fn test_repeated_hash_folds_later_diffs() {
        let db = crate::Database::open_in_memory().unwrap();
        let tx = db
            .write(crate::LockSet::union(&[
                crate::AccountStore::TABLES,
                UtxoSnapshotStore::TABLES,
            ]))
            .unwrap();
        let account = crate::AccountStore::new(&tx)
            .unwrap()
            .create("main", 1, crate::WalletKind::Utxo)
            .unwrap();
        let store = UtxoSnapshotStore::new(&tx, account.id).unwrap();
        let diff = |hash: &str, height: u64, spent: &[(&str, u32)], new: Vec<UtxoEntry>| UtxoDiff {
            last_best_block_hash: hash.to_string(),
            block_height: height,
            spent_utxo_ids: spent.iter().map(|(t, i)| UtxoEntry::make_id(t, *i)).collect(),
            new_utxos: new,
        };
        let steps = [
            diff("h1", 10, &[], vec![utxo("aa", 0, 5)]),
            diff("h2", 11, &[("aa", 0)], vec![utxo("bb", 0, 4)]),
            diff("h1", 10, &[("bb", 0)], vec![utxo("aa", 0, 5), utxo("cc", 1, 2)]),
        ];
        let mut sequential = BTreeMap::new();
        for step in &steps {
            apply_diff(&mut sequential, step);
            store.append_diff(step).unwrap();
        }

        let chain = store.get_diff_chain().unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].last_best_block_hash, "h1");
        assert_eq!(store.current_set().unwrap(), sequential);
    }
}
