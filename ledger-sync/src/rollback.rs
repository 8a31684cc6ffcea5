//! Reorg recovery
//!
//! Reverts every transaction of an account that is not yet final, frees the
//! outputs they consumed and rewinds the sync anchor to the best surviving
//! confirmed transaction.

use crate::Result;
use ledger_params::ConsensusParams;
use ledger_storage_sqlite::{
    AccountId, Database, LastSyncInfo, LastSyncStore, LockSet, SyncStateStorage, TransactionId,
    TransactionStore, TxStatus, UtxoSnapshotStore, UtxoStore,
};
use tracing::{info, warn};

/// Tables a rollback touches
pub fn rollback_locks() -> LockSet {
    LockSet::union(&[
        TransactionStore::TABLES,
        UtxoStore::TABLES,
        LastSyncStore::TABLES,
        UtxoSnapshotStore::TABLES,
    ])
}

/// Result of a rollback attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The account never synced a confirmed block
    NothingToRevert,
    /// Another sync moved the anchor since the divergence was observed
    Superseded {
        /// Anchor found when the write lock was taken
        current: LastSyncInfo,
    },
    /// Transactions reverted and anchor rewound
    RolledBack {
        /// Transactions forced to ROLLBACK_FAIL
        reverted: Vec<TransactionId>,
        /// Outputs made unspent again
        restored: usize,
        /// New anchor; empty when no confirmed transaction survived
        anchor: LastSyncInfo,
    },
}

/// Coordinates reorg recovery for one account
pub struct RollbackCoordinator<'a> {
    db: &'a Database,
    params: &'a ConsensusParams,
}

impl<'a> RollbackCoordinator<'a> {
    /// Create coordinator
    pub fn new(db: &'a Database, params: &'a ConsensusParams) -> Self {
        Self { db, params }
    }

    /// Anchor to hand to [`Self::rollback`] as the observed state
    pub fn observe(&self, account: AccountId) -> Result<LastSyncInfo> {
        Ok(SyncStateStorage::new(self.db).load_last_sync(account)?)
    }

    /// Revert everything of `account` at or above `best_height - stable_depth`.
    ///
    /// `observed` is the anchor read when the divergence was detected; if
    /// the stored anchor differs once the write lock is held, nothing
    /// changes.
    pub fn rollback(
        &self,
        account: AccountId,
        observed: &LastSyncInfo,
        best_height: u64,
    ) -> Result<RollbackOutcome> {
        if observed.is_empty() {
            return Ok(RollbackOutcome::NothingToRevert);
        }

        let tx = self.db.write(rollback_locks())?;
        let current = LastSyncStore::new(&tx)?.get(account)?;
        if &current != observed {
            info!(
                event = "rollback_superseded",
                account,
                observed_height = observed.height,
                current_height = current.height,
                "Anchor moved since divergence was detected, skipping rollback"
            );
            return Ok(RollbackOutcome::Superseded { current });
        }

        let threshold = self.params.unstable_from(best_height);
        let txs = TransactionStore::new(&tx)?;
        let mut reverted: Vec<TransactionId> = txs
            .confirmed_from_height(account, threshold)?
            .into_iter()
            .map(|t| t.id)
            .collect();
        reverted.extend(txs.with_status(account, TxStatus::Pending)?.into_iter().map(|t| t.id));

        // Statuses first: an output is only freed when no live input remains.
        txs.set_status(&reverted, TxStatus::RollbackFail)?;
        let known = txs.ids_for_account(account)?;
        let restored = UtxoStore::new(&tx)?.mark_consumed_unspent(&reverted, &known)?;

        let anchor = match txs.best_confirmed(account, Some(threshold))? {
            Some(best) => best
                .block
                .map(|b| LastSyncInfo::at(&b.info))
                .unwrap_or_default(),
            None => LastSyncInfo::default(),
        };
        let sync = LastSyncStore::new(&tx)?;
        let snapshot = UtxoSnapshotStore::new(&tx, account)?;
        if anchor.is_empty() {
            sync.clear(account)?;
            snapshot.clear()?;
        } else {
            sync.set(account, &anchor)?;
            let safe_above = snapshot
                .get_safe_point()?
                .is_some_and(|sp| sp.block_height > anchor.height);
            if safe_above {
                snapshot.clear()?;
            } else {
                snapshot.remove_diffs_above(anchor.height)?;
            }
        }
        let dropped_blocks = txs.delete_unreferenced_blocks()?;
        tx.commit()?;

        warn!(
            event = "rollback_completed",
            account,
            best_height,
            threshold,
            reverted = reverted.len(),
            restored,
            anchor_height = anchor.height,
            dropped_blocks,
            "Rolled back unstable transactions"
        );
        Ok(RollbackOutcome::RolledBack {
            reverted,
            restored,
            anchor,
        })
    }
}
