//! Wallet accounts and their owned addresses

use crate::addresses::AddressStore;
use crate::models::{AccountId, AddressId, LastSyncInfo, WalletAccount, WalletKind};
use crate::schema::{ScopedTx, Table};
use crate::sync_state::LastSyncStore;
use crate::{Error, Result};
use ledger_params::Network;
use rusqlite::{params, OptionalExtension};
use std::collections::{HashMap, HashSet};

/// Account operations inside a scoped transaction
pub struct AccountStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> AccountStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[
        Table::WalletAccount,
        Table::AccountAddress,
        Table::Address,
        Table::LastSyncInfo,
    ];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// Create an account with an empty sync anchor
    pub fn create(&self, name: &str, network_id: i64, kind: WalletKind) -> Result<WalletAccount> {
        self.tx.require_write()?;
        let network = Network::from_id(network_id)?;
        if kind.has_accounting() && !network.protocol.has_accounting() {
            return Err(Error::Validation(format!(
                "network {} has no accounting addresses",
                network.name
            )));
        }

        let created_at = chrono::Utc::now().timestamp();
        self.tx.execute(
            "INSERT INTO wallet_accounts (name, network_id, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, network_id, kind.as_str(), created_at],
        )?;
        let id = self.tx.last_insert_rowid();
        LastSyncStore::new(self.tx)?.set(id, &LastSyncInfo::default())?;

        tracing::info!(account = id, network = network.name, ?kind, "Created wallet account");
        Ok(WalletAccount {
            id,
            name: name.to_string(),
            network_id,
            kind,
            created_at,
        })
    }

    /// Account by id
    pub fn get(&self, id: AccountId) -> Result<Option<WalletAccount>> {
        self.tx
            .query_row(
                "SELECT id, name, network_id, kind, created_at FROM wallet_accounts WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, AccountId>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?
            .map(|(id, name, network_id, kind, created_at)| {
                Ok(WalletAccount {
                    id,
                    name,
                    network_id,
                    kind: WalletKind::parse(&kind)?,
                    created_at,
                })
            })
            .transpose()
    }

    /// Account by id, failing if it does not exist
    pub fn require(&self, id: AccountId) -> Result<WalletAccount> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("wallet account {id}")))
    }

    /// All accounts
    pub fn list(&self) -> Result<Vec<WalletAccount>> {
        let mut stmt = self.tx.prepare("SELECT id FROM wallet_accounts ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, AccountId>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.into_iter().map(|id| self.require(id)).collect()
    }

    /// Register discovered addresses as owned by `account`
    pub fn add_owned_addresses(
        &self,
        account: AccountId,
        hashes: &[String],
    ) -> Result<HashMap<String, AddressId>> {
        let wallet = self.require(account)?;
        let network = Network::from_id(wallet.network_id)?;
        let ids = AddressStore::new(self.tx)?.get_or_create(network.protocol, hashes)?;
        let mut stmt = self.tx.prepare(
            "INSERT OR IGNORE INTO account_addresses (account_id, address_id) VALUES (?1, ?2)",
        )?;
        let mut added = 0;
        for id in ids.values() {
            added += stmt.execute(params![account, id])?;
        }
        tracing::debug!(account, added, "Registered owned addresses");
        Ok(ids)
    }

    /// Owned address map: raw address to id
    pub fn owned_addresses(&self, account: AccountId) -> Result<HashMap<String, AddressId>> {
        let mut stmt = self.tx.prepare(
            r#"
            SELECT a.hash, a.id FROM account_addresses aa
            JOIN addresses a ON a.id = aa.address_id
            WHERE aa.account_id = ?1
            "#,
        )?;
        let rows = stmt.query_map([account], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let map = rows.collect::<std::result::Result<HashMap<String, AddressId>, _>>()?;
        Ok(map)
    }

    /// Owned address ids
    pub fn owned_address_ids(&self, account: AccountId) -> Result<HashSet<AddressId>> {
        let mut stmt = self
            .tx
            .prepare("SELECT address_id FROM account_addresses WHERE account_id = ?1")?;
        let rows = stmt.query_map([account], |row| row.get::<_, AddressId>(0))?;
        let set = rows.collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LockSet;
    use crate::Database;

    #[test]
    fn test_create_and_list_accounts() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(AccountStore::TABLES)).unwrap();
        let store = AccountStore::new(&tx).unwrap();
        let a = store.create("spending", 1, WalletKind::UtxoAndAccounting).unwrap();
        let b = store.create("savings", 250, WalletKind::Utxo).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed, vec![a, b]);
        assert!(store.get(99).unwrap().is_none());
        assert!(matches!(store.require(99), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_accounting_kind_rejected_on_utxo_only_chain() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(AccountStore::TABLES)).unwrap();
        let store = AccountStore::new(&tx).unwrap();
        assert!(matches!(
            store.create("ergo", 200, WalletKind::UtxoAndAccounting),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_owned_addresses() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(AccountStore::TABLES)).unwrap();
        let store = AccountStore::new(&tx).unwrap();
        let account = store.create("main", 1, WalletKind::Utxo).unwrap();
        let addr = format!("01{}", "ab".repeat(56));
        let ids = store.add_owned_addresses(account.id, &[addr.clone()]).unwrap();
        store.add_owned_addresses(account.id, &[addr.clone()]).unwrap();

        let owned = store.owned_addresses(account.id).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[&addr], ids[&addr]);
        assert!(store.owned_address_ids(account.id).unwrap().contains(&ids[&addr]));
    }
}
