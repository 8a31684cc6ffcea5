//! SQLite ledger store for multi-chain UTXO wallets
//!
//! Relational mirror of the wallet's view of the chain: addresses,
//! transactions, blocks, UTXO inputs/outputs, withdrawals, certificates and
//! multi-asset token lists, plus the per-account sync anchor and UTXO
//! snapshot. WAL mode, numbered migrations, foreign keys enforced.
//!
//! ## Access model
//!
//! - Every storage operation declares the tables it touches (`TABLES`).
//! - Callers open a [`ScopedTx`] over the union of those declarations
//!   ([`LockSet`]), closed over foreign-key dependents.
//! - Long identifiers are indexed by a seeded 64-bit [`digest`]; digest hits
//!   are always confirmed against the stored value.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accounts;
pub mod addresses;
pub mod certificates;
pub mod database;
pub mod digest;
pub mod error;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod schema;
pub mod sync_state;
pub mod tokens;
pub mod transactions;
pub mod utxo_snapshot;
pub mod utxos;

pub use accounts::AccountStore;
pub use addresses::AddressStore;
pub use certificates::CertificateStore;
pub use database::Database;
pub use error::{Error, Result};
pub use models::*;
pub use repository::{ensure_default_token, unspent_outputs, unspent_outputs_at, Repository, UNSPENT_TABLES};
pub use schema::{LockSet, ScopedTx, Table, TxMode};
pub use sync_state::{
    with_busy_retry, LastSyncStore, SyncStateStorage, BASE_BACKOFF_MS, MAX_BACKOFF_MS,
    MAX_BUSY_RETRIES,
};
pub use tokens::{parse_amount, TokenListStore, TokenStore};
pub use transactions::TransactionStore;
pub use utxo_snapshot::{address_set_hash, apply_diff, UtxoSnapshotStore};
pub use utxos::UtxoStore;
