//! Address catalog
//!
//! Addresses are looked up by digest and confirmed by exact string
//! comparison; a digest hit alone is never treated as a match.

use crate::models::{AddressId, AddressRow, AddressType};
use crate::schema::{placeholders, ScopedTx, Table, PARAM_CHUNK};
use crate::Result;
use ledger_params::ChainProtocol;
use rusqlite::params_from_iter;
use std::collections::{HashMap, HashSet};

/// Address operations inside a scoped transaction
pub struct AddressStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> AddressStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[Table::Address];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// Ids of the already stored addresses among `hashes`
    pub fn find(&self, hashes: &[String]) -> Result<HashMap<String, AddressId>> {
        let mut by_digest: HashMap<i64, Vec<&str>> = HashMap::new();
        for hash in hashes {
            by_digest
                .entry(self.tx.digest(hash))
                .or_default()
                .push(hash.as_str());
        }

        let digests: Vec<i64> = by_digest.keys().copied().collect();
        let mut found = HashMap::new();
        for chunk in digests.chunks(PARAM_CHUNK) {
            let sql = format!(
                "SELECT id, digest, hash FROM addresses WHERE digest IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, AddressId>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            for row in rows {
                let (id, digest, stored) = row?;
                let wanted = by_digest.get(&digest).map(Vec::as_slice).unwrap_or(&[]);
                if wanted.contains(&stored.as_str()) {
                    found.insert(stored, id);
                }
            }
        }
        Ok(found)
    }

    /// Ids of `hashes`, inserting the ones not yet stored
    pub fn get_or_create(
        &self,
        protocol: ChainProtocol,
        hashes: &[String],
    ) -> Result<HashMap<String, AddressId>> {
        self.tx.require_write()?;
        let mut ids = self.find(hashes)?;
        let mut seen = HashSet::new();
        for hash in hashes {
            if ids.contains_key(hash) || !seen.insert(hash.as_str()) {
                continue;
            }
            let address_type = AddressType::detect(protocol, hash)?;
            self.tx.execute(
                "INSERT INTO addresses (digest, hash, address_type, is_used) VALUES (?1, ?2, ?3, 0)",
                rusqlite::params![self.tx.digest(hash), hash, address_type.code()],
            )?;
            ids.insert(hash.clone(), self.tx.last_insert_rowid());
        }
        tracing::debug!(requested = hashes.len(), "Resolved address ids");
        Ok(ids)
    }

    /// Rows for `ids`
    pub fn get_by_ids(&self, ids: &[AddressId]) -> Result<Vec<AddressRow>> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                "SELECT id, hash, digest, address_type, is_used FROM addresses WHERE id IN ({}) ORDER BY id",
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, AddressId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?;
            for row in rows {
                let (id, hash, digest, address_type, is_used) = row?;
                out.push(AddressRow {
                    id,
                    hash,
                    digest,
                    address_type: AddressType::from_code(address_type)?,
                    is_used,
                });
            }
        }
        Ok(out)
    }

    /// Set the used flag on `ids`
    pub fn mark_used(&self, ids: &[AddressId]) -> Result<usize> {
        self.tx.require_write()?;
        let mut updated = 0;
        for chunk in ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                "UPDATE addresses SET is_used = 1 WHERE is_used = 0 AND id IN ({})",
                placeholders(chunk.len())
            );
            updated += self.tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        Ok(updated)
    }

    /// Delete addresses no account owns and no stored row references
    pub fn delete_unreferenced(&self) -> Result<usize> {
        self.tx.ensure(&[
            Table::AccountAddress,
            Table::UtxoInput,
            Table::UtxoOutput,
            Table::AccountingInput,
            Table::CertificateAddress,
        ])?;
        self.tx.require_write()?;
        let deleted = self.tx.execute(
            r#"
            DELETE FROM addresses WHERE
                id NOT IN (SELECT address_id FROM account_addresses)
                AND id NOT IN (SELECT address_id FROM utxo_inputs)
                AND id NOT IN (SELECT address_id FROM utxo_outputs)
                AND id NOT IN (SELECT address_id FROM accounting_inputs)
                AND id NOT IN (SELECT address_id FROM certificate_addresses)
            "#,
            [],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, "Removed unreferenced addresses");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LockSet;
    use crate::Database;

    fn shelley(n: u8) -> String {
        format!("61{}", hex::encode([n; 28]))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(AddressStore::TABLES)).unwrap();
        let store = AddressStore::new(&tx).unwrap();

        let addrs = vec![shelley(1), shelley(2), shelley(1)];
        let first = store.get_or_create(ChainProtocol::Cardano, &addrs).unwrap();
        assert_eq!(first.len(), 2);
        let second = store.get_or_create(ChainProtocol::Cardano, &addrs).unwrap();
        assert_eq!(first, second);

        let rows = store.get_by_ids(&[first[&shelley(2)]]).unwrap();
        assert_eq!(rows[0].address_type, AddressType::CardanoEnterprise);
        assert!(!rows[0].is_used);
    }

    #[test]
    fn test_find_ignores_digest_collisions() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(AddressStore::TABLES)).unwrap();
        let store = AddressStore::new(&tx).unwrap();
        let stored = shelley(3);
        let ids = store
            .get_or_create(ChainProtocol::Cardano, &[stored.clone()])
            .unwrap();

        // Force a second value onto the same digest.
        let impostor = shelley(4);
        tx.execute(
            "UPDATE addresses SET digest = ?1 WHERE id = ?2",
            rusqlite::params![tx.digest(&impostor), ids[&stored]],
        )
        .unwrap();

        let found = store.find(&[impostor]).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_mark_used() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(AddressStore::TABLES)).unwrap();
        let store = AddressStore::new(&tx).unwrap();
        let ids = store
            .get_or_create(ChainProtocol::Cardano, &[shelley(5)])
            .unwrap();
        let id = ids[&shelley(5)];
        assert_eq!(store.mark_used(&[id]).unwrap(), 1);
        assert_eq!(store.mark_used(&[id]).unwrap(), 0);
        assert!(store.get_by_ids(&[id]).unwrap()[0].is_used);
    }
}
