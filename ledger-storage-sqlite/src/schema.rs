//! Table registry and scoped transactions
//!
//! Every storage operation declares the tables it reads or writes. A
//! [`ScopedTx`] is opened over a [`LockSet`] computed from those
//! declarations, closed over the tables that depend on them through foreign
//! keys (a delete on `transactions` cascades into inputs, outputs, ...).
//! Touching a table outside the acquired set fails with
//! [`Error::LockViolation`].

use crate::{digest, Error, Result};
use rusqlite::{Connection, TransactionBehavior};
use std::fmt;
use std::ops::Deref;

/// Every table in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Install-wide metadata (digest seed)
    StoreMeta,
    /// Wallet accounts
    WalletAccount,
    /// Addresses seen by any account
    Address,
    /// Owned address mapping
    AccountAddress,
    /// Blocks referenced by transactions
    Block,
    /// Transactions
    Transaction,
    /// UTXO inputs
    UtxoInput,
    /// UTXO outputs
    UtxoOutput,
    /// Withdrawal-style inputs
    AccountingInput,
    /// Certificates
    Certificate,
    /// Certificate address relations
    CertificateAddress,
    /// Token catalog
    Token,
    /// Token list entries
    TokenList,
    /// Per-account sync anchor
    LastSyncInfo,
    /// Per-account UTXO snapshot
    UtxoAtSafePoint,
    /// Per-account UTXO diff chain
    UtxoDiffToBestBlock,
}

impl Table {
    /// All tables, in creation order.
    pub const ALL: [Table; 16] = [
        Table::StoreMeta,
        Table::WalletAccount,
        Table::Address,
        Table::AccountAddress,
        Table::Block,
        Table::Transaction,
        Table::UtxoInput,
        Table::UtxoOutput,
        Table::AccountingInput,
        Table::Certificate,
        Table::CertificateAddress,
        Table::Token,
        Table::TokenList,
        Table::LastSyncInfo,
        Table::UtxoAtSafePoint,
        Table::UtxoDiffToBestBlock,
    ];

    /// SQL table name
    pub const fn name(self) -> &'static str {
        match self {
            Table::StoreMeta => "store_meta",
            Table::WalletAccount => "wallet_accounts",
            Table::Address => "addresses",
            Table::AccountAddress => "account_addresses",
            Table::Block => "blocks",
            Table::Transaction => "transactions",
            Table::UtxoInput => "utxo_inputs",
            Table::UtxoOutput => "utxo_outputs",
            Table::AccountingInput => "accounting_inputs",
            Table::Certificate => "certificates",
            Table::CertificateAddress => "certificate_addresses",
            Table::Token => "tokens",
            Table::TokenList => "token_lists",
            Table::LastSyncInfo => "last_sync_info",
            Table::UtxoAtSafePoint => "utxo_at_safe_point",
            Table::UtxoDiffToBestBlock => "utxo_diff_to_best_block",
        }
    }

    /// Tables whose rows must be touched when rows of `self` are deleted.
    ///
    /// Mostly foreign keys with `ON DELETE CASCADE`; `token_lists` is listed
    /// under the rows that own a list id since it is cleaned up explicitly.
    pub const fn dependents(self) -> &'static [Table] {
        match self {
            Table::WalletAccount => &[
                Table::AccountAddress,
                Table::LastSyncInfo,
                Table::UtxoAtSafePoint,
                Table::UtxoDiffToBestBlock,
            ],
            Table::Address => &[
                Table::AccountAddress,
                Table::UtxoInput,
                Table::UtxoOutput,
                Table::AccountingInput,
                Table::CertificateAddress,
            ],
            Table::Block => &[Table::Transaction],
            Table::Transaction => &[
                Table::UtxoInput,
                Table::UtxoOutput,
                Table::AccountingInput,
                Table::Certificate,
            ],
            Table::UtxoInput | Table::UtxoOutput | Table::AccountingInput => &[Table::TokenList],
            Table::Certificate => &[Table::CertificateAddress],
            Table::Token => &[Table::TokenList],
            _ => &[],
        }
    }

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of tables closed over their dependents.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct LockSet(u32);

impl LockSet {
    /// Lock set covering `tables` and everything that depends on them.
    pub fn of(tables: &[Table]) -> Self {
        Self::default().with(tables)
    }

    /// Lock set covering every table; used by destructive operations.
    pub fn all() -> Self {
        Self::of(&Table::ALL)
    }

    /// Union of several declared table lists.
    pub fn union(groups: &[&[Table]]) -> Self {
        groups
            .iter()
            .fold(Self::default(), |set, tables| set.with(tables))
    }

    /// Extend with more tables (and their dependents).
    pub fn with(mut self, tables: &[Table]) -> Self {
        let mut pending: Vec<Table> = tables.to_vec();
        while let Some(table) = pending.pop() {
            if self.0 & table.bit() != 0 {
                continue;
            }
            self.0 |= table.bit();
            pending.extend_from_slice(table.dependents());
        }
        self
    }

    /// Whether `table` is covered.
    pub fn contains(&self, table: Table) -> bool {
        self.0 & table.bit() != 0
    }

    /// Iterate the covered tables.
    pub fn iter(&self) -> impl Iterator<Item = Table> + '_ {
        Table::ALL.into_iter().filter(|t| self.contains(*t))
    }

    /// Number of covered tables
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether no table is covered
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for LockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Table::name)).finish()
    }
}

/// Transaction access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Deferred transaction for consistent reads
    Read,
    /// Immediate transaction holding the write lock from the start
    Write,
}

/// A database transaction scoped to an explicit lock set.
pub struct ScopedTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
    locks: LockSet,
    mode: TxMode,
    digest_seed: u32,
}

impl<'conn> ScopedTx<'conn> {
    pub(crate) fn begin(
        conn: &'conn Connection,
        mode: TxMode,
        locks: LockSet,
        digest_seed: u32,
    ) -> Result<Self> {
        let behavior = match mode {
            TxMode::Read => TransactionBehavior::Deferred,
            TxMode::Write => TransactionBehavior::Immediate,
        };
        // Nested begins on one connection are rejected by SQLite.
        let tx = rusqlite::Transaction::new_unchecked(conn, behavior)?;
        tracing::trace!(?mode, ?locks, "Opened scoped transaction");
        Ok(Self {
            tx,
            locks,
            mode,
            digest_seed,
        })
    }

    /// Fail unless every table in `tables` is covered by the lock set.
    pub fn ensure(&self, tables: &[Table]) -> Result<()> {
        match tables.iter().find(|t| !self.locks.contains(**t)) {
            Some(missing) => Err(Error::LockViolation(missing.name())),
            None => Ok(()),
        }
    }

    /// Fail unless the transaction was opened for writing.
    pub fn require_write(&self) -> Result<()> {
        if self.mode == TxMode::Write {
            Ok(())
        } else {
            Err(Error::Validation(
                "write attempted inside a read-only transaction".to_string(),
            ))
        }
    }

    /// Acquired lock set
    pub fn locks(&self) -> LockSet {
        self.locks
    }

    /// Transaction mode
    pub fn mode(&self) -> TxMode {
        self.mode
    }

    /// Digest of `value` under this install's seed.
    pub fn digest(&self, value: &str) -> i64 {
        digest::digest(self.digest_seed, value)
    }

    /// Fail unless `table` is covered and the transaction can write.
    pub fn ensure_write(&self, tables: &[Table]) -> Result<()> {
        self.ensure(tables)?;
        self.require_write()
    }

    /// Commit the transaction
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

impl Deref for ScopedTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

/// `?, ?, ?` placeholder list for `IN (...)` clauses.
pub(crate) fn placeholders(count: usize) -> String {
    std::iter::repeat("?")
        .take(count)
        .collect::<Vec<_>>()
        .join(",")
}

/// Maximum bound parameters per statement chunk.
pub(crate) const PARAM_CHUNK: usize = 500;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_set_closes_over_cascades() {
        let locks = LockSet::of(&[Table::Transaction]);
        assert!(locks.contains(Table::Transaction));
        assert!(locks.contains(Table::UtxoInput));
        assert!(locks.contains(Table::Certificate));
        assert!(locks.contains(Table::CertificateAddress));
        assert!(locks.contains(Table::TokenList));
        assert!(!locks.contains(Table::Address));
        assert!(!locks.contains(Table::LastSyncInfo));
    }

    #[test]
    fn test_lock_set_all() {
        let locks = LockSet::all();
        assert_eq!(locks.len(), Table::ALL.len());
        assert!(Table::ALL.iter().all(|t| locks.contains(*t)));
    }

    #[test]
    fn test_lock_set_union() {
        let locks = LockSet::union(&[&[Table::Token], &[Table::LastSyncInfo]]);
        assert!(locks.contains(Table::TokenList));
        assert!(locks.contains(Table::LastSyncInfo));
        assert!(!locks.contains(Table::Transaction));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "?,?,?");
        assert_eq!(placeholders(0), "");
    }
}
