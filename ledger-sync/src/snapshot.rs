//! UTXO snapshot maintenance
//!
//! Keeps `safe point ⊕ diff chain` equal to the account's confirmed unspent
//! outputs. The first safe point is taken at the newest final block; after
//! each merge a corrective diff keyed by the best block is appended, and
//! diffs that have become final are folded into the safe point.
//! A snapshot taken for a different address universe is discarded.

use crate::Result;
use ledger_params::ConsensusParams;
use ledger_storage_sqlite::{
    address_set_hash, apply_diff, unspent_outputs, unspent_outputs_at, AccountId, AccountStore,
    BlockInfo, Database, LockSet, SafePoint, ScopedTx, TransactionStore, UtxoDiff, UtxoEntry,
    UtxoSnapshotStore, UNSPENT_TABLES,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Tables snapshot maintenance touches
pub fn snapshot_locks() -> LockSet {
    LockSet::union(&[UtxoSnapshotStore::TABLES, UNSPENT_TABLES, AccountStore::TABLES])
}

/// What [`reconcile`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    /// The stored snapshot belonged to another address set
    pub cleared: bool,
    /// A fresh safe point was written
    pub created: bool,
    /// Ids removed by the appended diff
    pub spent: usize,
    /// Entries added by the appended diff
    pub added: usize,
    /// Diffs folded into the safe point
    pub folded: usize,
}

/// Difference turning `from` into `to`, tagged with `block`
pub fn diff_between(
    from: &BTreeMap<String, UtxoEntry>,
    to: &BTreeMap<String, UtxoEntry>,
    block: &BlockInfo,
) -> UtxoDiff {
    UtxoDiff {
        last_best_block_hash: block.hash.clone(),
        block_height: block.height,
        spent_utxo_ids: from
            .keys()
            .filter(|id| !to.contains_key(*id))
            .cloned()
            .collect(),
        new_utxos: to
            .iter()
            .filter(|(id, entry)| from.get(*id) != Some(*entry))
            .map(|(_, entry)| entry.clone())
            .collect(),
    }
}

/// Bring the snapshot of `account` in line with its unspent outputs as of `best`
pub fn reconcile(
    tx: &ScopedTx<'_>,
    account: AccountId,
    params: &ConsensusParams,
    best: &BlockInfo,
) -> Result<SnapshotReport> {
    let owned: Vec<String> = AccountStore::new(tx)?
        .owned_addresses(account)?
        .into_keys()
        .collect();
    let set_hash = address_set_hash(&owned);
    let store = UtxoSnapshotStore::new(tx, account)?;
    let mut report = SnapshotReport::default();

    let mut safe_point = store.get_safe_point()?;
    if safe_point
        .as_ref()
        .is_some_and(|sp| sp.address_set_hash != set_hash)
    {
        store.clear()?;
        safe_point = None;
        report.cleared = true;
    }

    let current: BTreeMap<String, UtxoEntry> = unspent_outputs(tx, account)?
        .iter()
        .map(|u| {
            let entry = u.to_entry();
            (entry.utxo_id.clone(), entry)
        })
        .collect();

    let final_height = params.unstable_from(best.height);
    let safe_point = match safe_point {
        Some(sp) => sp,
        None => {
            let sp = baseline(tx, account, final_height, set_hash.clone())?;
            store.replace_safe_point(&sp)?;
            report.created = true;
            sp
        }
    };

    let diff = diff_between(&store.current_set()?, &current, best);
    if !diff.is_empty() {
        report.spent = diff.spent_utxo_ids.len();
        report.added = diff.new_utxos.len();
        store.append_diff(&diff)?;
    }

    let chain = store.get_diff_chain()?;
    let settled: Vec<&UtxoDiff> = chain
        .iter()
        .take_while(|d| d.block_height <= final_height)
        .collect();
    if let Some(last) = settled.last() {
        let mut set: BTreeMap<String, UtxoEntry> = safe_point
            .utxos
            .into_iter()
            .map(|u| (u.utxo_id.clone(), u))
            .collect();
        for d in &settled {
            apply_diff(&mut set, d);
        }
        store.replace_safe_point(&SafePoint {
            block_hash: last.last_best_block_hash.clone(),
            block_height: last.block_height,
            address_set_hash: set_hash,
            utxos: set.into_values().collect(),
        })?;
        report.folded = settled.len();
    }

    debug!(account, ?report, "Reconciled UTXO snapshot");
    Ok(report)
}

/// Safe point as of the newest block of `account` at or below `final_height`.
///
/// Without such a block the safe point is the empty set at height 0.
fn baseline(tx: &ScopedTx<'_>, account: AccountId, final_height: u64, set_hash: String) -> Result<SafePoint> {
    let block = TransactionStore::new(tx)?
        .best_confirmed(account, Some(final_height.saturating_add(1)))?
        .and_then(|t| t.block)
        .map(|b| b.info);
    let Some(block) = block else {
        return Ok(SafePoint {
            block_hash: String::new(),
            block_height: 0,
            address_set_hash: set_hash,
            utxos: Vec::new(),
        });
    };
    let utxos = unspent_outputs_at(tx, account, block.height)?
        .iter()
        .map(|u| u.to_entry())
        .collect();
    Ok(SafePoint {
        block_hash: block.hash,
        block_height: block.height,
        address_set_hash: set_hash,
        utxos,
    })
}

/// Snapshot access for one account, each call in its own transaction
pub struct SnapshotManager<'a> {
    db: &'a Database,
    account: AccountId,
}

impl<'a> SnapshotManager<'a> {
    /// Create manager
    pub fn new(db: &'a Database, account: AccountId) -> Self {
        Self { db, account }
    }

    /// Stored safe point
    pub fn get_safe_point_snapshot(&self) -> Result<Option<SafePoint>> {
        let tx = self.db.read(LockSet::of(UtxoSnapshotStore::TABLES))?;
        Ok(UtxoSnapshotStore::new(&tx, self.account)?.get_safe_point()?)
    }

    /// Diffs on top of the safe point, oldest first
    pub fn get_diff_chain(&self) -> Result<Vec<UtxoDiff>> {
        let tx = self.db.read(LockSet::of(UtxoSnapshotStore::TABLES))?;
        Ok(UtxoSnapshotStore::new(&tx, self.account)?.get_diff_chain()?)
    }

    /// Safe point with every diff applied
    pub fn current_set(&self) -> Result<BTreeMap<String, UtxoEntry>> {
        let tx = self.db.read(LockSet::of(UtxoSnapshotStore::TABLES))?;
        Ok(UtxoSnapshotStore::new(&tx, self.account)?.current_set()?)
    }

    /// Store `utxos` as the full set at `block` for the account's current
    /// address set
    pub fn replace_safe_point(&self, utxos: Vec<UtxoEntry>, block: &BlockInfo) -> Result<()> {
        let tx = self.db.write(snapshot_locks())?;
        let owned: Vec<String> = AccountStore::new(&tx)?
            .owned_addresses(self.account)?
            .into_keys()
            .collect();
        UtxoSnapshotStore::new(&tx, self.account)?.replace_safe_point(&SafePoint {
            block_hash: block.hash.clone(),
            block_height: block.height,
            address_set_hash: address_set_hash(&owned),
            utxos,
        })?;
        tx.commit()?;
        Ok(())
    }

    /// Append `diff`
    pub fn append_diff(&self, diff: &UtxoDiff) -> Result<()> {
        let tx = self.db.write(LockSet::of(UtxoSnapshotStore::TABLES))?;
        UtxoSnapshotStore::new(&tx, self.account)?.append_diff(diff)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove the diff keyed by `block_hash`
    pub fn remove_diff(&self, block_hash: &str) -> Result<bool> {
        let tx = self.db.write(LockSet::of(UtxoSnapshotStore::TABLES))?;
        let removed = UtxoSnapshotStore::new(&tx, self.account)?.remove_diff(block_hash)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Drop the safe point and the diff chain
    pub fn clear(&self) -> Result<()> {
        let tx = self.db.write(LockSet::of(UtxoSnapshotStore::TABLES))?;
        UtxoSnapshotStore::new(&tx, self.account)?.clear()?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tx: &str, index: u32, amount: u64) -> UtxoEntry {
        UtxoEntry {
            utxo_id: UtxoEntry::make_id(tx, index),
            tx_hash: tx.to_string(),
            tx_index: index,
            receiver: "addr".to_string(),
            amount: amount.to_string(),
            assets: Vec::new(),
            block_height: 5,
        }
    }

    fn set(entries: &[UtxoEntry]) -> BTreeMap<String, UtxoEntry> {
        entries.iter().map(|e| (e.utxo_id.clone(), e.clone())).collect()
    }

    #[test]
    fn test_diff_between_round_trips() {
        let block = BlockInfo {
            hash: "tip".into(),
            height: 9,
            slot: 90,
            time: 0,
        };
        let from = set(&[entry("a", 0, 1), entry("b", 0, 2)]);
        let to = set(&[entry("b", 0, 2), entry("c", 1, 3)]);

        let diff = diff_between(&from, &to, &block);
        assert_eq!(diff.spent_utxo_ids, vec![UtxoEntry::make_id("a", 0)]);
        assert_eq!(diff.new_utxos, vec![entry("c", 1, 3)]);
        assert_eq!(diff.block_height, 9);

        let mut applied = from.clone();
        apply_diff(&mut applied, &diff);
        assert_eq!(applied, to);
        assert!(diff_between(&to, &to, &block).is_empty());
    }
}
