//! Asset metadata resolution
//!
//! Runs in two halves so no database lock is held across network calls:
//! [`TokenResolver::stale_identifiers`] and [`TokenResolver::fetch`] happen
//! before the merge; [`ResolvedTokens::apply`] runs inside the merge
//! transaction and guarantees a catalog row for every identifier.

use crate::client::{with_retry, RemoteNetwork, RetryConfig};
use crate::{Error, Result};
use ledger_storage_sqlite::{ScopedTx, TokenId, TokenMetadata, TokenRow, TokenStore, PRIMARY_ASSET_ID};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Split `identifiers` into fresh and stale given the stored catalog rows.
///
/// The primary asset is always fresh. A stored row is fresh while its last
/// successful refresh is younger than `ttl_secs`; rows that never resolved
/// are stale.
pub fn partition(
    identifiers: &[String],
    stored: &HashMap<String, TokenRow>,
    now: i64,
    ttl_secs: i64,
) -> (Vec<String>, Vec<String>) {
    let mut fresh = Vec::new();
    let mut stale = Vec::new();
    let mut seen = HashSet::new();
    for id in identifiers {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let is_fresh = id == PRIMARY_ASSET_ID
            || stored.get(id).is_some_and(|row| {
                row.is_default || row.last_updated.is_some_and(|at| now - at < ttl_secs)
            });
        if is_fresh {
            fresh.push(id.clone());
        } else {
            stale.push(id.clone());
        }
    }
    (fresh, stale)
}

/// An asset is an NFT when it was minted exactly once and only one unit exists
pub fn is_nft(mint_events: &[serde_json::Value], supply: Option<&str>) -> bool {
    mint_events.len() == 1 && supply.map(str::trim) == Some("1")
}

/// Metadata fetched for one network, waiting to be written
#[derive(Debug, Default)]
pub struct ResolvedTokens {
    fetched: HashMap<String, (TokenMetadata, bool)>,
    failed: HashSet<String>,
    fetched_at: i64,
    error: Option<Error>,
}

impl ResolvedTokens {
    /// Nothing fetched
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of identifiers with fresh metadata
    pub fn len(&self) -> usize {
        self.fetched.len()
    }

    /// No metadata fetched
    pub fn is_empty(&self) -> bool {
        self.fetched.is_empty()
    }

    /// Identifiers whose fetch failed
    pub fn failed(&self) -> &HashSet<String> {
        &self.failed
    }

    /// Why some identifiers could not be resolved
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Write fetched metadata and make sure every identifier has a row.
    ///
    /// Existing rows keep their id. Identifiers without fetched metadata
    /// and without a row get an empty, never-refreshed entry so the next
    /// sync retries them. Returns identifier to id, primary asset included.
    pub fn apply(
        &self,
        tx: &ScopedTx<'_>,
        network_id: i64,
        identifiers: &[String],
    ) -> Result<HashMap<String, TokenId>> {
        let store = TokenStore::new(tx)?;
        let default_id = store.ensure_default(network_id)?;
        let stored = store.get_many(network_id, identifiers)?;

        let mut ids = HashMap::with_capacity(identifiers.len() + 1);
        ids.insert(PRIMARY_ASSET_ID.to_string(), default_id);
        for identifier in identifiers {
            if ids.contains_key(identifier) {
                continue;
            }
            let id = match (self.fetched.get(identifier), stored.get(identifier)) {
                (Some((metadata, nft)), _) => {
                    store.upsert(network_id, identifier, *nft, metadata, Some(self.fetched_at))?
                }
                (None, Some(row)) => row.id,
                (None, None) => {
                    store.upsert(network_id, identifier, false, &TokenMetadata::default(), None)?
                }
            };
            ids.insert(identifier.clone(), id);
        }
        debug!(
            network_id,
            tokens = ids.len(),
            refreshed = self.fetched.len(),
            "Applied token metadata"
        );
        Ok(ids)
    }
}

/// Fetches asset metadata from the remote
pub struct TokenResolver<R: RemoteNetwork + ?Sized> {
    remote: Arc<R>,
    ttl_secs: i64,
    retry: RetryConfig,
}

impl<R: RemoteNetwork + ?Sized> TokenResolver<R> {
    /// Create resolver
    pub fn new(remote: Arc<R>, ttl_secs: i64, retry: RetryConfig) -> Self {
        Self {
            remote,
            ttl_secs,
            retry,
        }
    }

    /// Identifiers among `identifiers` whose cached metadata is missing or expired
    pub fn stale_identifiers(
        &self,
        tx: &ScopedTx<'_>,
        network_id: i64,
        identifiers: &[String],
        now: i64,
    ) -> Result<Vec<String>> {
        let stored = TokenStore::new(tx)?.get_many(network_id, identifiers)?;
        let (_, stale) = partition(identifiers, &stored, now, self.ttl_secs);
        Ok(stale)
    }

    /// Fetch metadata, mint events and supply for `stale`.
    ///
    /// Never fails: whatever could not be fetched is reported in
    /// [`ResolvedTokens::failed`] with an [`Error::Resolver`] in
    /// [`ResolvedTokens::error`], and logged.
    pub async fn fetch(&self, network_id: i64, stale: &[String], now: i64) -> ResolvedTokens {
        let mut resolved = ResolvedTokens {
            fetched_at: now,
            ..Default::default()
        };
        if stale.is_empty() {
            return resolved;
        }

        let info = match with_retry(&self.retry, "token info", || {
            self.remote.fetch_token_info(network_id, stale)
        })
        .await
        {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    event = "token_resolver_failed",
                    network_id,
                    count = stale.len(),
                    error = %e,
                    "Token metadata unavailable, continuing without it"
                );
                resolved.failed.extend(stale.iter().cloned());
                resolved.error = Some(Error::Resolver(format!(
                    "token info for {} assets: {e}",
                    stale.len()
                )));
                return resolved;
            }
        };

        // Mint events and supply only refine the NFT flag.
        let mint = with_retry(&self.retry, "mint metadata", || {
            self.remote.fetch_mint_metadata(network_id, stale)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(event = "token_mint_lookup_failed", network_id, error = %e);
            HashMap::new()
        });
        let supply = with_retry(&self.retry, "token supply", || {
            self.remote.fetch_supply(network_id, stale)
        })
        .await
        .unwrap_or_else(|e| {
            warn!(event = "token_supply_lookup_failed", network_id, error = %e);
            HashMap::new()
        });

        for identifier in stale {
            let Some(token) = info.get(identifier) else {
                resolved.failed.insert(identifier.clone());
                continue;
            };
            let events = mint.get(identifier).map(Vec::as_slice).unwrap_or(&[]);
            let token_supply = supply.get(identifier).map(String::as_str);
            let metadata = TokenMetadata {
                decimals: token.decimals,
                ticker: token.ticker.clone(),
                name: token.name.clone(),
                logo: token.logo.clone(),
                mint_metadata: (!events.is_empty())
                    .then(|| serde_json::Value::Array(events.to_vec())),
                supply: token_supply.map(str::to_string),
            };
            resolved
                .fetched
                .insert(identifier.clone(), (metadata, is_nft(events, token_supply)));
        }

        if !resolved.failed.is_empty() {
            warn!(
                event = "token_metadata_missing",
                network_id,
                missing = resolved.failed.len(),
                "Remote returned no metadata for some assets"
            );
            resolved.error = Some(Error::Resolver(format!(
                "no metadata for {} of {} assets",
                resolved.failed.len(),
                stale.len()
            )));
        }
        debug!(
            network_id,
            fetched = resolved.fetched.len(),
            failed = resolved.failed.len(),
            "Resolved token metadata"
        );
        resolved
    }
}
