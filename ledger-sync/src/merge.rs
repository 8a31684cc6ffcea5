//! Transaction batch merge
//!
//! Folds one window of remote history into the store inside a single write
//! transaction:
//!
//! 1. match incoming hashes against the account's stored transactions
//! 2. update matches in place unless already confirmed
//! 3. make sure every referenced asset has a catalog row
//! 4. insert the rest with their inputs, outputs, withdrawals and certificates
//! 5. mark the outputs consumed by new live inputs as spent
//! 6. retire pending transactions the remote no longer reports

use crate::certificates::CertificateNormalizer;
use crate::remote::{RemoteAsset, RemoteTransaction};
use crate::token_resolver::ResolvedTokens;
use crate::{Error, Result};
use ledger_params::{ChainProtocol, Network};
use ledger_storage_sqlite::{
    parse_amount, AccountStore, AddressId, AddressStore, CertificateStore, ListId, LockSet,
    NewAccountingInput, NewTransaction, NewUtxoInput, NewUtxoOutput, ScopedTx, TokenId,
    TokenListStore, TokenStore, TransactionExtra, TransactionId, TransactionStore, TxStatus,
    UtxoStore, WalletAccount, PRIMARY_ASSET_ID,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Tables a merge touches
pub fn merge_locks() -> LockSet {
    LockSet::union(&[
        AccountStore::TABLES,
        AddressStore::TABLES,
        TransactionStore::TABLES,
        UtxoStore::TABLES,
        CertificateStore::TABLES,
        TokenStore::TABLES,
        TokenListStore::TABLES,
    ])
}

/// Inputs of a merge besides the remote window
pub struct MergeContext<'a> {
    /// Account being synced
    pub account: &'a WalletAccount,
    /// Its network
    pub network: Network,
    /// Asset metadata fetched ahead of the merge
    pub tokens: &'a ResolvedTokens,
}

/// What a merge changed
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Newly stored transactions
    pub inserted: Vec<TransactionId>,
    /// Stored transactions rewritten in place
    pub updated: Vec<TransactionId>,
    /// Confirmed re-deliveries left untouched
    pub unchanged: usize,
    /// Pending transactions the remote no longer reports
    pub not_in_remote: Vec<TransactionId>,
    /// Outputs flipped from unspent to spent
    pub newly_spent: usize,
    /// Outputs flipped back to unspent
    pub restored: usize,
    /// Transaction ids of the account after the merge
    pub known_ids: HashSet<TransactionId>,
}

impl MergeOutcome {
    /// Nothing was written
    pub fn is_noop(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.not_in_remote.is_empty()
    }
}

/// Merge `batch` into the store for `ctx.account`.
///
/// `tx` must be a write transaction holding [`merge_locks`].
pub fn merge_batch(
    tx: &ScopedTx<'_>,
    ctx: &MergeContext<'_>,
    batch: &[RemoteTransaction],
) -> Result<MergeOutcome> {
    tx.require_write()?;
    let account = ctx.account.id;
    let network_id = ctx.account.network_id;
    let txs = TransactionStore::new(tx)?;
    let utxos = UtxoStore::new(tx)?;
    let batch = dedupe(batch);

    let mut known = txs.ids_for_account(account)?;
    let mut outcome = MergeOutcome::default();
    let mut seen: HashSet<TransactionId> = HashSet::new();

    // Digest hits are only trusted inside the account's own id set.
    let hashes: Vec<String> = batch.iter().map(|t| t.hash.clone()).collect();
    let stored = txs.find_by_hashes(network_id, &hashes, Some(&known))?;

    let mut revived = Vec::new();
    let mut killed = Vec::new();
    let mut fresh = Vec::new();
    for remote in &batch {
        let Some(row) = stored.get(&remote.hash) else {
            fresh.push(*remote);
            continue;
        };
        seen.insert(row.id);
        if row.status == TxStatus::InBlock {
            outcome.unchanged += 1;
            continue;
        }
        let update = new_transaction(&txs, ctx, remote)?;
        txs.update(row.id, &update)?;
        match (row.status.is_live(), update.status.is_live()) {
            (false, true) => revived.push(row.id),
            (true, false) => killed.push(row.id),
            _ => {}
        }
        debug!(
            tx_hash = %remote.hash,
            from = ?row.status,
            to = ?update.status,
            "Updated stored transaction"
        );
        outcome.updated.push(row.id);
    }

    let mut referenced: HashSet<AddressId> = HashSet::new();
    if !fresh.is_empty() {
        let asset_ids: Vec<String> = {
            let mut ids: Vec<String> = fresh.iter().flat_map(|t| t.asset_ids()).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let token_ids = ctx.tokens.apply(tx, network_id, &asset_ids)?;
        let addresses = resolve_addresses(tx, ctx, &fresh)?;

        let mut writer = RowWriter {
            txs: &txs,
            utxos: &utxos,
            lists: TokenListStore::new(tx)?,
            certs: CertificateStore::new(tx)?,
            normalizer: CertificateNormalizer::new(ctx.network.address_network_tag, &addresses),
            addresses: &addresses,
            token_ids: &token_ids,
            default_token: *token_ids
                .get(PRIMARY_ASSET_ID)
                .ok_or_else(|| Error::Validation(format!("no default token for network {network_id}")))?,
            next_list: 0,
            counters: HashMap::new(),
            with_accounting: ctx.account.kind.has_accounting(),
        };
        writer.next_list = writer.lists.next_list_id()?;

        for remote in &fresh {
            let id = writer.insert(ctx, remote, &mut referenced)?;
            known.insert(id);
            seen.insert(id);
            outcome.inserted.push(id);
            if remote.status().is_live() {
                revived.push(id);
            }
        }
    }

    // Dead statuses must be in place before outputs are released.
    outcome.restored += utxos.mark_consumed_unspent(&killed, &known)?;
    outcome.newly_spent += utxos.mark_consumed_spent(&revived, &known)?;

    let pending = txs.with_status(account, TxStatus::Pending)?;
    let (still_pending, vanished): (Vec<_>, Vec<_>) =
        pending.into_iter().partition(|t| seen.contains(&t.id));
    if !vanished.is_empty() {
        let ids: Vec<TransactionId> = vanished.iter().map(|t| t.id).collect();
        txs.set_status(&ids, TxStatus::NotInRemote)?;
        outcome.restored += utxos.mark_consumed_unspent(&ids, &known)?;
        for t in &vanished {
            debug!(tx_hash = %t.hash, "Pending transaction not in remote");
        }
        outcome.not_in_remote = ids;
    }
    if still_pending.len() > 1 {
        warn!(
            event = "multiple_pending",
            account,
            count = still_pending.len(),
            "More than one pending transaction"
        );
    }

    let owned = AccountStore::new(tx)?.owned_address_ids(account)?;
    let used: Vec<AddressId> = referenced.intersection(&owned).copied().collect();
    AddressStore::new(tx)?.mark_used(&used)?;
    txs.delete_unreferenced_blocks()?;

    debug!(
        account,
        inserted = outcome.inserted.len(),
        updated = outcome.updated.len(),
        unchanged = outcome.unchanged,
        not_in_remote = outcome.not_in_remote.len(),
        newly_spent = outcome.newly_spent,
        "Merged transaction batch"
    );
    outcome.known_ids = known;
    Ok(outcome)
}

/// Last occurrence of each hash, in first-seen order
fn dedupe(batch: &[RemoteTransaction]) -> Vec<&RemoteTransaction> {
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<&RemoteTransaction> = Vec::with_capacity(batch.len());
    for remote in batch {
        match position.get(remote.hash.as_str()) {
            Some(&i) => out[i] = remote,
            None => {
                position.insert(remote.hash.as_str(), out.len());
                out.push(remote);
            }
        }
    }
    out
}

/// Row fields shared by insert and update
fn new_transaction(
    txs: &TransactionStore<'_>,
    ctx: &MergeContext<'_>,
    remote: &RemoteTransaction,
) -> Result<NewTransaction> {
    let status = remote.status();
    let block_id = match (&remote.block, status) {
        (Some(block), TxStatus::InBlock) => {
            Some(txs.upsert_block(ctx.account.network_id, &block.to_info())?)
        }
        _ => None,
    };
    let extra = match ctx.network.protocol {
        ChainProtocol::Cardano => TransactionExtra::Cardano {
            fee: remote.fee.clone().unwrap_or_else(|| "0".to_string()),
            is_valid: remote.is_valid,
        },
        ChainProtocol::Ergo => TransactionExtra::Ergo,
    };
    Ok(NewTransaction {
        hash: remote.hash.clone(),
        network_id: ctx.account.network_id,
        block_id,
        ordinal: block_id.and(remote.ordinal),
        status,
        error_message: remote.error_message.clone(),
        extra: Some(extra),
    })
}

/// Ids for every address the new transactions reference.
///
/// Addresses of inputs, outputs, withdrawals and certificate reward
/// accounts are stored on first sight; reconstructed key addresses are
/// only looked up.
fn resolve_addresses(
    tx: &ScopedTx<'_>,
    ctx: &MergeContext<'_>,
    fresh: &[&RemoteTransaction],
) -> Result<HashMap<String, AddressId>> {
    let mut direct: Vec<String> = Vec::new();
    let mut certs = Vec::new();
    for remote in fresh {
        direct.extend(remote.addresses());
        for cert in &remote.certificates {
            direct.extend(
                crate::certificates::direct_addresses(cert)
                    .into_iter()
                    .map(|(address, _)| address),
            );
            certs.push(cert.clone());
        }
    }
    let store = AddressStore::new(tx)?;
    let mut ids = store.get_or_create(ctx.network.protocol, &direct)?;
    if !certs.is_empty() {
        let candidates =
            CertificateNormalizer::lookup_candidates(ctx.network.address_network_tag, &certs)?;
        ids.extend(store.find(&candidates)?);
    }
    Ok(ids)
}

struct RowWriter<'t, 'a> {
    txs: &'t TransactionStore<'a>,
    utxos: &'t UtxoStore<'a>,
    lists: TokenListStore<'a>,
    certs: CertificateStore<'a>,
    normalizer: CertificateNormalizer<'t>,
    addresses: &'t HashMap<String, AddressId>,
    token_ids: &'t HashMap<String, TokenId>,
    default_token: TokenId,
    next_list: ListId,
    counters: HashMap<AddressId, u64>,
    with_accounting: bool,
}

impl RowWriter<'_, '_> {
    fn insert(
        &mut self,
        ctx: &MergeContext<'_>,
        remote: &RemoteTransaction,
        referenced: &mut HashSet<AddressId>,
    ) -> Result<TransactionId> {
        let row = new_transaction(self.txs, ctx, remote)?;
        let id = self.txs.insert(&row)?;

        for (index, input) in remote.inputs.iter().enumerate() {
            let address_id = self.address(&input.address)?;
            let token_list_id = self.token_list(&input.amount, &input.assets)?;
            self.utxos.insert_input(
                id,
                &NewUtxoInput {
                    address_id,
                    parent_tx_hash: input.tx_hash.clone(),
                    parent_index: input.index,
                    input_index: index as u32,
                    token_list_id,
                },
            )?;
            referenced.insert(address_id);
        }

        for (index, output) in remote.outputs.iter().enumerate() {
            let address_id = self.address(&output.address)?;
            let token_list_id = self.token_list(&output.amount, &output.assets)?;
            self.utxos.insert_output(
                id,
                &remote.hash,
                &NewUtxoOutput {
                    address_id,
                    output_index: index as u32,
                    token_list_id,
                },
            )?;
            referenced.insert(address_id);
        }

        if self.with_accounting {
            for (index, withdrawal) in remote.withdrawals.iter().enumerate() {
                let address_id = self.address(&withdrawal.address)?;
                let spending_counter = match self.counters.get(&address_id) {
                    Some(next) => *next,
                    None => self.utxos.accounting_count(address_id)?,
                };
                self.counters.insert(address_id, spending_counter + 1);
                let token_list_id = self.token_list(&withdrawal.amount, &[])?;
                self.utxos.insert_accounting_input(
                    id,
                    &NewAccountingInput {
                        address_id,
                        spending_counter,
                        input_index: index as u32,
                        token_list_id,
                    },
                )?;
            }
        } else if !remote.withdrawals.is_empty() {
            debug!(tx_hash = %remote.hash, "Ignoring withdrawals for a UTXO-only account");
        }

        for (ordinal, cert) in remote.certificates.iter().enumerate() {
            let normalized = self.normalizer.normalize(ordinal as u32, cert)?;
            self.certs.insert(id, &normalized)?;
        }

        debug!(
            tx_hash = %remote.hash,
            id,
            inputs = remote.inputs.len(),
            outputs = remote.outputs.len(),
            status = ?row.status,
            "Inserted transaction"
        );
        Ok(id)
    }

    fn address(&self, address: &str) -> Result<AddressId> {
        self.addresses
            .get(address)
            .copied()
            .ok_or_else(|| Error::StaleState(format!("address {address} missing after discovery")))
    }

    fn token_list(&mut self, amount: &str, assets: &[RemoteAsset]) -> Result<ListId> {
        let mut entries: Vec<(TokenId, u128)> = Vec::with_capacity(assets.len() + 1);
        entries.push((self.default_token, parse_amount(amount)?));
        for asset in assets {
            let token = if asset.asset_id == PRIMARY_ASSET_ID {
                self.default_token
            } else {
                *self.token_ids.get(&asset.asset_id).ok_or_else(|| {
                    Error::StaleState(format!("token {} has no catalog row", asset.asset_id))
                })?
            };
            let value = parse_amount(&asset.amount)?;
            // One entry per token: repeated assets are summed
            match entries.iter_mut().find(|(id, _)| *id == token) {
                Some((_, total)) => {
                    *total = total.checked_add(value).ok_or_else(|| {
                        Error::Validation(format!("amount overflow for token {}", asset.asset_id))
                    })?;
                }
                None => entries.push((token, value)),
            }
        }
        let list_id = self.next_list;
        self.lists.insert(list_id, self.default_token, &entries)?;
        self.next_list += 1;
        Ok(list_id)
    }
}
