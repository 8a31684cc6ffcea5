//! Sync orchestrator
//!
//! One sync cycle for an account:
//!
//! 1. read the account, its owned addresses and its confirmed anchor
//! 2. fetch the remote tip and the history window after the anchor
//! 3. on divergence, roll back and fetch again from the rewound anchor
//! 4. fetch metadata for assets not seen before
//! 5. merge, move the anchor and reconcile the UTXO snapshot in one write
//!
//! The database mutex is only taken inside synchronous sections and is
//! never held across an `.await`.

use crate::cancel::CancelToken;
use crate::client::{check_request, with_retry, HistoryAnchor, HistoryRequest, RemoteNetwork, RetryConfig, TxPointer};
use crate::merge::{merge_batch, merge_locks, MergeContext};
use crate::remote::{BestBlock, RemoteTransaction};
use crate::rollback::{RollbackCoordinator, RollbackOutcome};
use crate::snapshot::{reconcile, SnapshotReport};
use crate::token_resolver::TokenResolver;
use crate::{Error, Result};
use ledger_params::{ConsensusParams, Network};
use ledger_storage_sqlite::{
    ensure_default_token, AccountId, AccountStore, Database, LastSyncInfo, LastSyncStore, LockSet,
    SyncStateStorage, TokenStore, TransactionStore, UtxoSnapshotStore, WalletAccount, WalletKind,
    UNSPENT_TABLES,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Transactions per history page
    pub history_page_size: usize,
    /// Upper bound on pages fetched in one cycle
    pub max_pages: usize,
    /// Retry policy for remote calls
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_page_size: 50,
            max_pages: 200,
            retry: RetryConfig::default(),
        }
    }
}

/// Summary of one sync cycle
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Account synced
    pub account: AccountId,
    /// Remote tip the cycle synced to
    pub best_block: Option<BestBlock>,
    /// Remote transactions received
    pub fetched: usize,
    /// Transactions stored for the first time
    pub inserted: usize,
    /// Stored transactions rewritten
    pub updated: usize,
    /// Confirmed re-deliveries left as they were
    pub unchanged: usize,
    /// Pending transactions retired as not in remote
    pub not_in_remote: usize,
    /// Assets whose metadata was refreshed
    pub tokens_refreshed: usize,
    /// Assets whose metadata could not be fetched
    pub tokens_failed: usize,
    /// Resolver failure behind `tokens_failed`
    pub token_error: Option<String>,
    /// Rollback performed before the merge, if any
    pub rollback: Option<RollbackOutcome>,
    /// Snapshot maintenance
    pub snapshot: SnapshotReport,
}

/// State read before any network call
struct SyncPlan {
    wallet: WalletAccount,
    network: Network,
    params: ConsensusParams,
    addresses: Vec<String>,
    anchor: Option<TxPointer>,
    observed: LastSyncInfo,
}

/// Sync engine
pub struct SyncEngine {
    db: Arc<Mutex<Database>>,
    remote: Arc<dyn RemoteNetwork>,
    config: SyncConfig,
    cancel: CancelToken,
}

#[allow(dead_code)]
fn _assert_sync_engine_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<SyncEngine>();
}

impl SyncEngine {
    /// Create engine over a shared database
    pub fn new(db: Arc<Mutex<Database>>, remote: Arc<dyn RemoteNetwork>, config: SyncConfig) -> Self {
        Self {
            db,
            remote,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Shared database handle
    pub fn database(&self) -> Arc<Mutex<Database>> {
        Arc::clone(&self.db)
    }

    /// Configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Token stopping this engine between phases
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Create an account and the primary asset row of its network
    pub fn create_account(&self, name: &str, network_id: i64, kind: WalletKind) -> Result<WalletAccount> {
        let db = self.db.lock();
        ensure_default_token(&db, network_id)?;
        let tx = db.write(LockSet::of(AccountStore::TABLES))?;
        let account = AccountStore::new(&tx)?.create(name, network_id, kind)?;
        tx.commit()?;
        info!(account = account.id, network_id, kind = kind.as_str(), "Created wallet account");
        Ok(account)
    }

    /// Register derived addresses as owned by `account`
    pub fn register_addresses(&self, account: AccountId, addresses: &[String]) -> Result<usize> {
        let db = self.db.lock();
        let tx = db.write(LockSet::of(AccountStore::TABLES))?;
        let ids = AccountStore::new(&tx)?.add_owned_addresses(account, addresses)?;
        tx.commit()?;
        Ok(ids.len())
    }

    /// Ask the remote which of `candidates` are in use and register those.
    ///
    /// Returns the used subset in the order given.
    pub async fn discover_addresses(&self, account: AccountId, candidates: &[String]) -> Result<Vec<String>> {
        self.check_cancelled()?;
        let in_use = with_retry(&self.config.retry, "address scan", || {
            self.remote.check_addresses_in_use(candidates)
        })
        .await?;
        let used: Vec<String> = candidates
            .iter()
            .filter(|a| in_use.contains(*a))
            .cloned()
            .collect();
        if !used.is_empty() {
            self.register_addresses(account, &used)?;
        }
        debug!(account, scanned = candidates.len(), used = used.len(), "Address discovery");
        Ok(used)
    }

    /// Sync every account, one after the other
    pub async fn sync_all(&self) -> Result<Vec<(AccountId, Result<SyncReport>)>> {
        let accounts: Vec<AccountId> = {
            let db = self.db.lock();
            let tx = db.read(LockSet::of(AccountStore::TABLES))?;
            let ids: Vec<AccountId> = AccountStore::new(&tx)?.list()?.into_iter().map(|a| a.id).collect();
            ids
        };
        let mut out = Vec::with_capacity(accounts.len());
        for account in accounts {
            let result = self.sync_account(account).await;
            if let Err(e) = &result {
                warn!(event = "sync_failed", account, error = %e, "Sync failed, will retry");
            }
            out.push((account, result));
        }
        Ok(out)
    }

    /// Run one sync cycle for `account`
    pub async fn sync_account(&self, account: AccountId) -> Result<SyncReport> {
        self.check_cancelled()?;
        let mut plan = {
            let db = self.db.lock();
            load_plan(&db, account)?
        };
        let network_id = plan.wallet.network_id;
        let mut report = SyncReport {
            account,
            ..Default::default()
        };

        let best = with_retry(&self.config.retry, "best block", || {
            self.remote.fetch_best_block(network_id)
        })
        .await?;
        report.best_block = Some(best.clone());
        info!(
            event = "sync_started",
            account,
            best_height = best.height,
            anchor_height = plan.observed.height,
            addresses = plan.addresses.len()
        );

        let fetched = self.fetch_window(&plan, &best).await;
        let batch = match fetched {
            Ok(batch) => batch,
            Err(Error::RollbackRequired(reason)) => {
                warn!(event = "rollback_required", account, reason = %reason);
                let outcome = {
                    let db = self.db.lock();
                    RollbackCoordinator::new(&db, &plan.params).rollback(
                        account,
                        &plan.observed,
                        best.height,
                    )?
                };
                report.rollback = Some(outcome);
                plan = {
                    let db = self.db.lock();
                    load_plan(&db, account)?
                };
                self.fetch_window(&plan, &best).await?
            }
            Err(e) => return Err(e),
        };
        report.fetched = batch.len();
        self.check_cancelled()?;

        let resolver = TokenResolver::new(
            Arc::clone(&self.remote),
            plan.params.token_metadata_ttl_secs,
            self.config.retry.clone(),
        );
        let now = chrono::Utc::now().timestamp();
        let stale = {
            let db = self.db.lock();
            let tx = db.read(LockSet::union(&[TransactionStore::TABLES, TokenStore::TABLES]))?;
            let known = TransactionStore::new(&tx)?.ids_for_account(account)?;
            let hashes: Vec<String> = batch.iter().map(|t| t.hash.clone()).collect();
            let stored = TransactionStore::new(&tx)?.find_by_hashes(network_id, &hashes, Some(&known))?;
            let mut asset_ids: Vec<String> = batch
                .iter()
                .filter(|t| !stored.contains_key(&t.hash))
                .flat_map(|t| t.asset_ids())
                .collect();
            asset_ids.sort_unstable();
            asset_ids.dedup();
            resolver.stale_identifiers(&tx, network_id, &asset_ids, now)?
        };
        let resolved = resolver.fetch(network_id, &stale, now).await;
        report.tokens_refreshed = resolved.len();
        report.tokens_failed = resolved.failed().len();
        report.token_error = resolved.error().map(ToString::to_string);

        let best_info = best.to_info();
        {
            let db = self.db.lock();
            let locks = merge_locks()
                .with(LastSyncStore::TABLES)
                .with(UtxoSnapshotStore::TABLES)
                .with(UNSPENT_TABLES);
            let tx = db.write(locks)?;
            let ctx = MergeContext {
                account: &plan.wallet,
                network: plan.network.clone(),
                tokens: &resolved,
            };
            let outcome = merge_batch(&tx, &ctx, &batch)?;

            let sync = LastSyncStore::new(&tx)?;
            let current = sync.get(account)?;
            if current.height <= best.height {
                sync.set(account, &LastSyncInfo::at(&best_info))?;
            } else {
                debug!(account, current = current.height, "Anchor already past this tip");
            }
            report.snapshot = reconcile(&tx, account, &plan.params, &best_info)?;
            tx.commit()?;

            report.inserted = outcome.inserted.len();
            report.updated = outcome.updated.len();
            report.unchanged = outcome.unchanged;
            report.not_in_remote = outcome.not_in_remote.len();
        }

        info!(
            event = "sync_completed",
            account,
            best_height = best.height,
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            not_in_remote = report.not_in_remote,
            rolled_back = report.rollback.is_some()
        );
        Ok(report)
    }

    /// History after the plan's anchor, paged; without an anchor only the
    /// newest `history_window_cap` transactions are requested
    async fn fetch_window(&self, plan: &SyncPlan, best: &BestBlock) -> Result<Vec<RemoteTransaction>> {
        let mut out: Vec<RemoteTransaction> = Vec::new();
        if plan.addresses.is_empty() {
            return Ok(out);
        }

        let page_size = self.config.history_page_size.max(1);
        let mut anchor = plan.anchor.clone().map(HistoryAnchor::After);
        let windowed = anchor.is_none();
        let mut limit = if windowed {
            plan.params.history_window_cap as usize
        } else {
            page_size
        };

        for page_no in 0..self.config.max_pages {
            let request = HistoryRequest {
                addresses: plan.addresses.clone(),
                anchor: anchor.clone(),
                until_block: best.hash.clone(),
                limit,
            };
            check_request(&request)?;
            let page = with_retry(&self.config.retry, "history", || {
                self.remote.fetch_history(&request)
            })
            .await?;

            let full = page.len() >= limit;
            let next = page
                .iter()
                .rev()
                .filter(|t| t.is_confirmed())
                .find_map(|t| {
                    t.block.as_ref().map(|b| TxPointer {
                        block_hash: b.hash.clone(),
                        tx_hash: Some(t.hash.clone()),
                    })
                });
            debug!(page = page_no, received = page.len(), limit, "Fetched history page");
            out.extend(page);

            if windowed || !full {
                break;
            }
            match next {
                Some(pointer) => anchor = Some(HistoryAnchor::After(pointer)),
                None => break,
            }
            limit = page_size;
            self.check_cancelled()?;
        }
        Ok(out)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

fn load_plan(db: &Database, account: AccountId) -> Result<SyncPlan> {
    let observed = SyncStateStorage::new(db).load_last_sync(account)?;
    let tx = db.read(LockSet::union(&[AccountStore::TABLES, TransactionStore::TABLES]))?;
    let wallet = AccountStore::new(&tx)?.require(account)?;
    let network = Network::from_id(wallet.network_id)?;
    let params = ConsensusParams::from_network(network.network_type);

    let mut addresses: Vec<String> = AccountStore::new(&tx)?
        .owned_addresses(account)?
        .into_keys()
        .collect();
    addresses.sort_unstable();

    // Rows are shared between accounts: only trust the ones at or below
    // this account's own anchor.
    let anchor = if observed.is_empty() {
        None
    } else {
        TransactionStore::new(&tx)?
            .best_confirmed(account, Some(observed.height.saturating_add(1)))?
            .and_then(|t| {
                t.block.map(|b| TxPointer {
                    block_hash: b.info.hash,
                    tx_hash: Some(t.hash),
                })
            })
    };
    drop(tx);

    ensure_default_token(db, network.id)?;
    Ok(SyncPlan {
        wallet,
        network,
        params,
        addresses,
        anchor,
        observed,
    })
}
