//! Data access layer for the application
//!
//! Read-side queries (history, pending, balances) and the destructive
//! operations (wallet removal, history reset). Every call runs in its own
//! scoped transaction; destructive ones lock every table.

use crate::accounts::AccountStore;
use crate::addresses::AddressStore;
use crate::certificates::CertificateStore;
use crate::models::*;
use crate::schema::{LockSet, ScopedTx, Table};
use crate::sync_state::LastSyncStore;
use crate::tokens::{TokenListStore, TokenStore};
use crate::transactions::{TransactionStore, ACCOUNT_TX_IDS};
use crate::utxo_snapshot::UtxoSnapshotStore;
use crate::utxos::UtxoStore;
use crate::{Database, Result};
use rusqlite::params;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Tables read by [`unspent_outputs`] and [`unspent_outputs_at`]
pub const UNSPENT_TABLES: &[Table] = &[
    Table::UtxoOutput,
    Table::UtxoInput,
    Table::AccountAddress,
    Table::Address,
    Table::Transaction,
    Table::Block,
    Table::TokenList,
    Table::Token,
];

/// Confirmed unspent outputs owned by `account`
pub fn unspent_outputs(tx: &ScopedTx<'_>, account: AccountId) -> Result<Vec<UnspentOutput>> {
    let sql = r#"
        SELECT o.id, t.hash, o.output_index, a.hash, b.height, o.token_list_id
        FROM utxo_outputs o
        JOIN account_addresses aa ON aa.address_id = o.address_id AND aa.account_id = ?1
        JOIN addresses a ON a.id = o.address_id
        JOIN transactions t ON t.id = o.transaction_id
        JOIN blocks b ON b.id = t.block_id
        WHERE o.is_unspent = 1 AND t.status = ?2
        ORDER BY b.height, t.ordinal, o.output_index
    "#;
    query_unspent(tx, sql, params![account, TxStatus::InBlock.code()])
}

/// Outputs owned by `account` that were unspent right after block `height`.
///
/// Only confirmed transactions at or below `height` count, both as creators
/// and as spenders; later spends and pending ones are ignored.
pub fn unspent_outputs_at(tx: &ScopedTx<'_>, account: AccountId, height: u64) -> Result<Vec<UnspentOutput>> {
    let sql = r#"
        SELECT o.id, t.hash, o.output_index, a.hash, b.height, o.token_list_id
        FROM utxo_outputs o
        JOIN account_addresses aa ON aa.address_id = o.address_id AND aa.account_id = ?1
        JOIN addresses a ON a.id = o.address_id
        JOIN transactions t ON t.id = o.transaction_id
        JOIN blocks b ON b.id = t.block_id
        WHERE t.status = ?2 AND b.height <= ?3
          AND NOT EXISTS (
            SELECT 1 FROM utxo_inputs i
            JOIN transactions st ON st.id = i.transaction_id
            JOIN blocks sb ON sb.id = st.block_id
            WHERE i.parent_tx_digest = t.digest AND i.parent_tx_hash = t.hash
              AND i.parent_index = o.output_index
              AND st.status = ?2 AND sb.height <= ?3
          )
        ORDER BY b.height, t.ordinal, o.output_index
    "#;
    query_unspent(
        tx,
        sql,
        params![account, TxStatus::InBlock.code(), height as i64],
    )
}

fn query_unspent<P: rusqlite::Params>(tx: &ScopedTx<'_>, sql: &str, args: P) -> Result<Vec<UnspentOutput>> {
    tx.ensure(UNSPENT_TABLES)?;
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, u32>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, ListId>(5)?,
        ))
    })?;
    let rows = rows.collect::<std::result::Result<Vec<_>, _>>()?;

    let list_ids: Vec<ListId> = rows.iter().map(|r| r.5).collect();
    let mut amounts = TokenListStore::new(tx)?.get_amounts(&list_ids)?;
    Ok(rows
        .into_iter()
        .map(|(output_id, tx_hash, output_index, address, height, list_id)| UnspentOutput {
            output_id,
            tx_hash,
            output_index,
            address,
            block_height: height as u64,
            tokens: amounts.remove(&list_id).unwrap_or_default(),
        })
        .collect())
}

/// Repository for application reads and destructive operations
pub struct Repository<'a> {
    db: &'a Database,
}

impl<'a> Repository<'a> {
    /// Create repository
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// One page of history, unconfirmed first then newest block first
    pub fn history(&self, account: AccountId, skip: usize, limit: usize) -> Result<Vec<HistoryEntry>> {
        let locks = LockSet::union(&[
            TransactionStore::TABLES,
            UtxoStore::TABLES,
            CertificateStore::TABLES,
            TokenListStore::TABLES,
            AddressStore::TABLES,
        ]);
        let tx = self.db.read(locks)?;
        let transactions = TransactionStore::new(&tx)?.history_page(account, skip, limit)?;
        let ids: Vec<TransactionId> = transactions.iter().map(|t| t.id).collect();

        let utxos = UtxoStore::new(&tx)?;
        let inputs = utxos.inputs_of(&ids)?;
        let outputs = utxos.outputs_of(&ids)?;
        let withdrawals = utxos.accounting_inputs_of(&ids)?;
        let certificates = CertificateStore::new(&tx)?.of_transactions(&ids)?;

        let address_ids: Vec<AddressId> = inputs
            .iter()
            .map(|i| i.input.address_id)
            .chain(outputs.iter().map(|o| o.output.address_id))
            .chain(withdrawals.iter().map(|w| w.input.address_id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let addresses: HashMap<AddressId, String> = AddressStore::new(&tx)?
            .get_by_ids(&address_ids)?
            .into_iter()
            .map(|a| (a.id, a.hash))
            .collect();
        let list_ids: Vec<ListId> = inputs
            .iter()
            .map(|i| i.input.token_list_id)
            .chain(outputs.iter().map(|o| o.output.token_list_id))
            .chain(withdrawals.iter().map(|w| w.input.token_list_id))
            .collect();
        let amounts = TokenListStore::new(&tx)?.get_amounts(&list_ids)?;

        let io = |address_id: AddressId, list_id: ListId| HistoryIo {
            address: addresses.get(&address_id).cloned().unwrap_or_default(),
            tokens: amounts.get(&list_id).cloned().unwrap_or_default(),
        };

        Ok(transactions
            .into_iter()
            .map(|transaction| {
                let id = transaction.id;
                HistoryEntry {
                    inputs: inputs
                        .iter()
                        .filter(|i| i.transaction_id == id)
                        .map(|i| io(i.input.address_id, i.input.token_list_id))
                        .collect(),
                    outputs: outputs
                        .iter()
                        .filter(|o| o.transaction_id == id)
                        .map(|o| io(o.output.address_id, o.output.token_list_id))
                        .collect(),
                    withdrawals: withdrawals
                        .iter()
                        .filter(|w| w.transaction_id == id)
                        .map(|w| io(w.input.address_id, w.input.token_list_id))
                        .collect(),
                    certificates: certificates
                        .iter()
                        .filter(|c| c.transaction_id == id)
                        .cloned()
                        .collect(),
                    transaction,
                }
            })
            .collect())
    }

    /// Pending transactions of `account`
    pub fn pending(&self, account: AccountId) -> Result<Vec<TransactionRow>> {
        let tx = self.db.read(LockSet::of(TransactionStore::TABLES))?;
        TransactionStore::new(&tx)?.with_status(account, TxStatus::Pending)
    }

    /// Addresses appearing in the account's transactions that it does not own
    pub fn foreign_addresses(&self, account: AccountId) -> Result<Vec<String>> {
        let tx = self.db.read(LockSet::union(&[
            TransactionStore::TABLES,
            UtxoStore::TABLES,
            AddressStore::TABLES,
        ]))?;
        let sql = format!(
            r#"
            SELECT a.hash FROM addresses a WHERE a.id IN (
                SELECT address_id FROM utxo_inputs WHERE transaction_id IN ({ACCOUNT_TX_IDS})
                UNION
                SELECT address_id FROM utxo_outputs WHERE transaction_id IN ({ACCOUNT_TX_IDS})
            )
            AND a.id NOT IN (SELECT address_id FROM account_addresses WHERE account_id = ?1)
            ORDER BY a.hash
            "#
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map([account], |row| row.get::<_, String>(0))?;
        let out = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    /// Confirmed unspent outputs of `account`
    pub fn unspent(&self, account: AccountId) -> Result<Vec<UnspentOutput>> {
        let tx = self.db.read(LockSet::of(UNSPENT_TABLES))?;
        unspent_outputs(&tx, account)
    }

    /// Balance per owned address holding unspent outputs
    pub fn balance_by_address(&self, account: AccountId) -> Result<BTreeMap<String, MultiToken>> {
        let mut out: BTreeMap<String, MultiToken> = BTreeMap::new();
        for utxo in self.unspent(account)? {
            out.entry(utxo.address).or_default().join(&utxo.tokens);
        }
        Ok(out)
    }

    /// Balance of the whole account
    pub fn wallet_balance(&self, account: AccountId) -> Result<MultiToken> {
        let mut total = MultiToken::new();
        for utxo in self.unspent(account)? {
            total.join(&utxo.tokens);
        }
        Ok(total)
    }

    /// Remove an account with every row only it references
    pub fn remove_wallet(&self, account: AccountId) -> Result<()> {
        let tx = self.db.write(LockSet::all())?;
        AccountStore::new(&tx)?.require(account)?;
        let purged = purge_history(&tx, account)?;
        tx.execute("DELETE FROM wallet_accounts WHERE id = ?1", [account])?;
        collect_garbage(&tx)?;
        tx.commit()?;
        tracing::info!(account, purged, "Removed wallet account");
        Ok(())
    }

    /// Drop the account's history and sync state, keeping the account and
    /// its owned addresses
    pub fn reset_history(&self, account: AccountId) -> Result<()> {
        let tx = self.db.write(LockSet::all())?;
        AccountStore::new(&tx)?.require(account)?;
        let purged = purge_history(&tx, account)?;
        LastSyncStore::new(&tx)?.clear(account)?;
        UtxoSnapshotStore::new(&tx, account)?.clear()?;
        collect_garbage(&tx)?;
        tx.commit()?;
        tracing::info!(account, purged, "Reset wallet history");
        Ok(())
    }
}

/// Delete the account's transactions that no other account relates to.
///
/// Outputs of surviving transactions that only the purged inputs consumed
/// become unspent again.
fn purge_history(tx: &ScopedTx<'_>, account: AccountId) -> Result<usize> {
    let store = TransactionStore::new(tx)?;
    let mine = store.ids_for_account(account)?;
    let mut shared = HashSet::new();
    for other in AccountStore::new(tx)?.list()? {
        if other.id != account {
            shared.extend(store.ids_for_account(other.id)?);
        }
    }
    let purge: Vec<TransactionId> = mine.difference(&shared).copied().collect();
    if purge.is_empty() {
        return Ok(0);
    }

    store.set_status(&purge, TxStatus::RollbackFail)?;
    UtxoStore::new(tx)?.mark_consumed_unspent(&purge, &shared)?;
    store.delete(&purge)
}

fn collect_garbage(tx: &ScopedTx<'_>) -> Result<()> {
    TokenListStore::new(tx)?.delete_orphans()?;
    TransactionStore::new(tx)?.delete_unreferenced_blocks()?;
    AddressStore::new(tx)?.delete_unreferenced()?;
    Ok(())
}

/// Ensure the primary asset exists for `network_id`
pub fn ensure_default_token(db: &Database, network_id: i64) -> Result<TokenId> {
    let tx = db.write(LockSet::of(TokenStore::TABLES))?;
    let id = TokenStore::new(&tx)?.ensure_default(network_id)?;
    tx.commit()?;
    Ok(id)
}
