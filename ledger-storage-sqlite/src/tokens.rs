//! Token catalog and token lists
//!
//! Every input and output carries a token list. The primary asset is always
//! present in a list, with a zero amount if nothing of it moved.

use crate::models::{ListId, MultiToken, TokenId, TokenListEntry, TokenMetadata, TokenRow, PRIMARY_ASSET_ID};
use crate::schema::{placeholders, ScopedTx, Table, PARAM_CHUNK};
use crate::{Error, Result};
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::{HashMap, HashSet};

/// Token catalog operations inside a scoped transaction
pub struct TokenStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> TokenStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[Table::Token];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// Id of the primary asset of `network_id`, creating it on first use
    pub fn ensure_default(&self, network_id: i64) -> Result<TokenId> {
        if let Some(row) = self.get(network_id, PRIMARY_ASSET_ID)? {
            return Ok(row.id);
        }
        self.tx.require_write()?;
        let network = ledger_params::Network::from_id(network_id)?;
        let metadata = TokenMetadata {
            decimals: Some(network.primary_decimals),
            ticker: Some(network.primary_ticker.to_string()),
            ..Default::default()
        };
        self.insert(network_id, PRIMARY_ASSET_ID, true, false, &metadata, None)
    }

    /// Id of the primary asset of `network_id`; a missing row is a validation error
    pub fn default_token(&self, network_id: i64) -> Result<TokenRow> {
        self.get(network_id, PRIMARY_ASSET_ID)?.ok_or_else(|| {
            Error::Validation(format!("no default token for network {network_id}"))
        })
    }

    /// Catalog entry for one identifier
    pub fn get(&self, network_id: i64, identifier: &str) -> Result<Option<TokenRow>> {
        let mut found = self.get_many(network_id, &[identifier.to_string()])?;
        Ok(found.remove(identifier))
    }

    /// Catalog entries for `identifiers`, keyed by identifier
    pub fn get_many(
        &self,
        network_id: i64,
        identifiers: &[String],
    ) -> Result<HashMap<String, TokenRow>> {
        let wanted: HashSet<&str> = identifiers.iter().map(String::as_str).collect();
        let digests: Vec<i64> = wanted
            .iter()
            .map(|id| self.tx.digest(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut out = HashMap::new();
        for chunk in digests.chunks(PARAM_CHUNK) {
            let sql = format!(
                r#"
                SELECT id, identifier, is_default, is_nft, metadata, last_updated
                FROM tokens WHERE network_id = ? AND digest IN ({})
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let bind = std::iter::once(network_id).chain(chunk.iter().copied());
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok((
                    row.get::<_, TokenId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?;
            for row in rows {
                let (id, identifier, is_default, is_nft, metadata, last_updated) = row?;
                if !wanted.contains(identifier.as_str()) {
                    continue;
                }
                out.insert(
                    identifier.clone(),
                    TokenRow {
                        id,
                        network_id,
                        identifier,
                        is_default,
                        is_nft,
                        metadata: serde_json::from_str(&metadata)?,
                        last_updated,
                    },
                );
            }
        }
        Ok(out)
    }

    /// Insert or refresh a catalog entry.
    ///
    /// An existing row keeps its id so token lists referencing it stay valid.
    pub fn upsert(
        &self,
        network_id: i64,
        identifier: &str,
        is_nft: bool,
        metadata: &TokenMetadata,
        last_updated: Option<i64>,
    ) -> Result<TokenId> {
        self.tx.require_write()?;
        match self.get(network_id, identifier)? {
            Some(existing) => {
                self.tx.execute(
                    "UPDATE tokens SET is_nft = ?1, metadata = ?2, last_updated = ?3 WHERE id = ?4",
                    params![
                        is_nft,
                        serde_json::to_string(metadata)?,
                        last_updated,
                        existing.id
                    ],
                )?;
                Ok(existing.id)
            }
            None => self.insert(network_id, identifier, false, is_nft, metadata, last_updated),
        }
    }

    fn insert(
        &self,
        network_id: i64,
        identifier: &str,
        is_default: bool,
        is_nft: bool,
        metadata: &TokenMetadata,
        last_updated: Option<i64>,
    ) -> Result<TokenId> {
        self.tx.execute(
            r#"
            INSERT INTO tokens (network_id, digest, identifier, is_default, is_nft, metadata, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                network_id,
                self.tx.digest(identifier),
                identifier,
                is_default,
                is_nft,
                serde_json::to_string(metadata)?,
                last_updated
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }
}

/// Token list operations inside a scoped transaction
pub struct TokenListStore<'a> {
    tx: &'a ScopedTx<'a>,
}

impl<'a> TokenListStore<'a> {
    /// Tables touched
    pub const TABLES: &'static [Table] = &[Table::TokenList, Table::Token];

    /// Bind to `tx`
    pub fn new(tx: &'a ScopedTx<'a>) -> Result<Self> {
        tx.ensure(Self::TABLES)?;
        Ok(Self { tx })
    }

    /// First list id not used by any stored entry
    pub fn next_list_id(&self) -> Result<ListId> {
        let max: Option<ListId> = self
            .tx
            .query_row("SELECT MAX(list_id) FROM token_lists", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Store a list.
    ///
    /// `entries` must reference the default token of the list's network
    /// exactly once; any other count is rejected.
    pub fn insert(&self, list_id: ListId, default_token: TokenId, entries: &[(TokenId, u128)]) -> Result<()> {
        self.tx.require_write()?;
        let primary = entries.iter().filter(|(token, _)| *token == default_token).count();
        if primary != 1 {
            return Err(Error::Validation(format!(
                "token list {list_id} has {primary} primary asset entries"
            )));
        }
        let mut stmt = self
            .tx
            .prepare("INSERT INTO token_lists (list_id, token_id, amount) VALUES (?1, ?2, ?3)")?;
        for (token_id, amount) in entries {
            stmt.execute(params![list_id, token_id, amount.to_string()])?;
        }
        Ok(())
    }

    /// Entries of `list_ids`, keyed by list id, in insertion order
    pub fn get(&self, list_ids: &[ListId]) -> Result<HashMap<ListId, Vec<TokenListEntry>>> {
        let mut out: HashMap<ListId, Vec<TokenListEntry>> = HashMap::new();
        for chunk in list_ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                r#"
                SELECT tl.list_id, tl.token_id, t.identifier, tl.amount
                FROM token_lists tl JOIN tokens t ON t.id = tl.token_id
                WHERE tl.list_id IN ({})
                ORDER BY tl.id
                "#,
                placeholders(chunk.len())
            );
            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, ListId>(0)?,
                    row.get::<_, TokenId>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for row in rows {
                let (list_id, token_id, identifier, amount) = row?;
                out.entry(list_id).or_default().push(TokenListEntry {
                    token_id,
                    identifier,
                    amount: parse_amount(&amount)?,
                });
            }
        }
        Ok(out)
    }

    /// Lists folded into multi-asset amounts
    pub fn get_amounts(&self, list_ids: &[ListId]) -> Result<HashMap<ListId, MultiToken>> {
        Ok(self
            .get(list_ids)?
            .into_iter()
            .map(|(list_id, entries)| {
                let mut tokens = MultiToken::new();
                for entry in entries {
                    tokens.add(&entry.identifier, entry.amount);
                }
                (list_id, tokens)
            })
            .collect())
    }

    /// Delete entries no input, output or withdrawal references
    pub fn delete_orphans(&self) -> Result<usize> {
        self.tx
            .ensure(&[Table::UtxoInput, Table::UtxoOutput, Table::AccountingInput])?;
        self.tx.require_write()?;
        let deleted = self.tx.execute(
            r#"
            DELETE FROM token_lists WHERE
                list_id NOT IN (SELECT token_list_id FROM utxo_inputs)
                AND list_id NOT IN (SELECT token_list_id FROM utxo_outputs)
                AND list_id NOT IN (SELECT token_list_id FROM accounting_inputs)
            "#,
            [],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, "Removed orphaned token list entries");
        }
        Ok(deleted)
    }
}

/// Parse a stored decimal amount
pub fn parse_amount(value: &str) -> Result<u128> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("invalid amount {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LockSet;
    use crate::Database;
    use proptest::prelude::*;

    #[test]
    fn test_default_token_is_created_once() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(TokenStore::TABLES)).unwrap();
        let store = TokenStore::new(&tx).unwrap();
        assert!(store.default_token(1).is_err());
        let id = store.ensure_default(1).unwrap();
        assert_eq!(store.ensure_default(1).unwrap(), id);
        let row = store.default_token(1).unwrap();
        assert!(row.is_default);
        assert_eq!(row.metadata.ticker.as_deref(), Some("ADA"));
        assert_ne!(store.ensure_default(200).unwrap(), id);
    }

    #[test]
    fn test_upsert_preserves_id() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(TokenStore::TABLES)).unwrap();
        let store = TokenStore::new(&tx).unwrap();
        let first = store
            .upsert(1, "policy.asset", false, &TokenMetadata::default(), None)
            .unwrap();
        let metadata = TokenMetadata {
            ticker: Some("TKN".to_string()),
            decimals: Some(2),
            ..Default::default()
        };
        let second = store
            .upsert(1, "policy.asset", true, &metadata, Some(42))
            .unwrap();
        assert_eq!(first, second);
        let row = store.get(1, "policy.asset").unwrap().unwrap();
        assert!(row.is_nft);
        assert_eq!(row.metadata, metadata);
        assert_eq!(row.last_updated, Some(42));
    }

    #[test]
    fn test_list_requires_primary_asset() {
        let db = Database::open_in_memory().unwrap();
        let tx = db.write(LockSet::of(TokenListStore::TABLES)).unwrap();
        let tokens = TokenStore::new(&tx).unwrap();
        let default = tokens.ensure_default(1).unwrap();
        let asset = tokens
            .upsert(1, "policy.asset", false, &TokenMetadata::default(), None)
            .unwrap();
        let lists = TokenListStore::new(&tx).unwrap();
        assert!(lists.insert(0, default, &[(asset, 3)]).is_err());
        assert!(matches!(
            lists.insert(0, default, &[(default, 1), (asset, 3), (default, 0)]),
            Err(Error::Validation(_))
        ));
        assert_eq!(lists.next_list_id().unwrap(), 0);
        lists.insert(0, default, &[(default, 0), (asset, 3)]).unwrap();
        assert_eq!(lists.next_list_id().unwrap(), 1);

        let amounts = lists.get_amounts(&[0]).unwrap();
        assert_eq!(amounts[&0].primary(), 0);
        assert_eq!(amounts[&0].get("policy.asset"), 3);
    }

    proptest! {
        #[test]
        fn prop_amounts_survive_storage(amount in any::<u128>()) {
            let db = Database::open_in_memory().unwrap();
            let tx = db.write(LockSet::of(TokenListStore::TABLES)).unwrap();
            let default = TokenStore::new(&tx).unwrap().ensure_default(1).unwrap();
            let lists = TokenListStore::new(&tx).unwrap();
            lists.insert(7, default, &[(default, amount)]).unwrap();
            let stored = lists.get(&[7]).unwrap();
            prop_assert_eq!(stored[&7][0].amount, amount);
            prop_assert_eq!(stored[&7][0].identifier.as_str(), PRIMARY_ASSET_ID);
        }
    }
}
