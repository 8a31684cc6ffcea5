//! In-memory remote backed by a recorded chain view
//!
//! Serves history windows, tips and asset metadata from a [`ChainFixture`]
//! with the same ordering and divergence rules a live indexer follows.
//! Used by the sync harness to replay JSON captures and by tests.

use crate::certificates::direct_addresses;
use crate::client::{HistoryAnchor, HistoryRequest, RemoteNetwork, TxPointer};
use crate::remote::{BestBlock, RemoteTransaction, TokenInfo};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Recorded remote state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainFixture {
    /// Tip
    pub best_block: BestBlock,
    /// Every transaction the remote knows, in any order
    #[serde(default)]
    pub transactions: Vec<RemoteTransaction>,
    /// Asset display metadata
    #[serde(default)]
    pub tokens: HashMap<String, TokenInfo>,
    /// Mint events per asset
    #[serde(default)]
    pub mint_events: HashMap<String, Vec<serde_json::Value>>,
    /// Supply per asset
    #[serde(default)]
    pub supply: HashMap<String, String>,
}

impl ChainFixture {
    /// Parse a JSON capture
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Validation(format!("fixture: {e}")))
    }

    fn touches(tx: &RemoteTransaction, addresses: &HashSet<&str>) -> bool {
        tx.addresses().iter().any(|a| addresses.contains(a.as_str()))
            || tx.certificates.iter().any(|c| {
                direct_addresses(c)
                    .iter()
                    .any(|(a, _)| addresses.contains(a.as_str()))
            })
    }

    fn block_height(&self, hash: &str) -> Option<u64> {
        if self.best_block.hash == hash {
            return Some(self.best_block.height);
        }
        self.transactions
            .iter()
            .filter_map(|t| t.block.as_ref())
            .find(|b| b.hash == hash)
            .map(|b| b.height)
    }

    fn history(&self, request: &HistoryRequest) -> Result<Vec<RemoteTransaction>> {
        let until = self.block_height(&request.until_block).ok_or_else(|| {
            Error::RollbackRequired(format!("unknown block {}", request.until_block))
        })?;
        let wanted: HashSet<&str> = request.addresses.iter().map(String::as_str).collect();

        let mut confirmed: Vec<&RemoteTransaction> = self
            .transactions
            .iter()
            .filter(|t| t.is_confirmed() && Self::touches(t, &wanted))
            .filter(|t| t.block.as_ref().is_some_and(|b| b.height <= until))
            .collect();
        confirmed.sort_by_key(|t| {
            (
                t.block.as_ref().map_or(0, |b| b.height),
                t.ordinal.unwrap_or(0),
            )
        });
        let unconfirmed = self
            .transactions
            .iter()
            .filter(|t| !t.is_confirmed() && Self::touches(t, &wanted));

        let position = |pointer: &TxPointer| -> Result<(u64, Option<usize>)> {
            let height = self.block_height(&pointer.block_hash).ok_or_else(|| {
                Error::RollbackRequired(format!("unknown block {}", pointer.block_hash))
            })?;
            let index = pointer
                .tx_hash
                .as_ref()
                .and_then(|hash| confirmed.iter().position(|t| &t.hash == hash));
            Ok((height, index))
        };

        let out: Vec<&RemoteTransaction> = match &request.anchor {
            None => {
                let all: Vec<&RemoteTransaction> =
                    confirmed.iter().copied().chain(unconfirmed).collect();
                let skip = all.len().saturating_sub(request.limit);
                all.into_iter().skip(skip).collect()
            }
            Some(HistoryAnchor::After(pointer)) => {
                let (height, index) = position(pointer)?;
                let after: Vec<&RemoteTransaction> = match index {
                    Some(i) => confirmed[i + 1..].to_vec(),
                    None => confirmed
                        .iter()
                        .copied()
                        .filter(|t| t.block.as_ref().is_some_and(|b| b.height > height))
                        .collect(),
                };
                after.into_iter().chain(unconfirmed).take(request.limit).collect()
            }
            Some(HistoryAnchor::Before(pointer)) => {
                let (height, index) = position(pointer)?;
                let before: Vec<&RemoteTransaction> = match index {
                    Some(i) => confirmed[..i].to_vec(),
                    None => confirmed
                        .iter()
                        .copied()
                        .filter(|t| t.block.as_ref().is_some_and(|b| b.height < height))
                        .collect(),
                };
                let skip = before.len().saturating_sub(request.limit);
                before.into_iter().skip(skip).collect()
            }
        };
        Ok(out.into_iter().cloned().collect())
    }
}

/// [`RemoteNetwork`] over a mutable [`ChainFixture`]
#[derive(Default)]
pub struct FixtureRemote {
    chain: Mutex<ChainFixture>,
    offline: AtomicBool,
    tokens_offline: AtomicBool,
    history_calls: AtomicUsize,
}

impl FixtureRemote {
    /// Serve `chain`
    pub fn new(chain: ChainFixture) -> Self {
        Self {
            chain: Mutex::new(chain),
            ..Default::default()
        }
    }

    /// Replace the served chain (e.g. to simulate a reorg)
    pub fn set_chain(&self, chain: ChainFixture) {
        *self.chain.lock() = chain;
    }

    /// Edit the served chain in place
    pub fn update<F: FnOnce(&mut ChainFixture)>(&self, edit: F) {
        edit(&mut self.chain.lock());
    }

    /// Fail every call with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail asset metadata calls only
    pub fn set_tokens_offline(&self, offline: bool) {
        self.tokens_offline.store(offline, Ordering::SeqCst);
    }

    /// Number of history requests served or refused
    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("remote unreachable".into()));
        }
        Ok(())
    }

    fn check_tokens_online(&self) -> Result<()> {
        self.check_online()?;
        if self.tokens_offline.load(Ordering::SeqCst) {
            return Err(Error::Network("token service unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteNetwork for FixtureRemote {
    async fn fetch_history(&self, request: &HistoryRequest) -> Result<Vec<RemoteTransaction>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.chain.lock().history(request)
    }

    async fn fetch_best_block(&self, _network_id: i64) -> Result<BestBlock> {
        self.check_online()?;
        Ok(self.chain.lock().best_block.clone())
    }

    async fn fetch_token_info(
        &self,
        _network_id: i64,
        ids: &[String],
    ) -> Result<HashMap<String, TokenInfo>> {
        self.check_tokens_online()?;
        let chain = self.chain.lock();
        Ok(ids
            .iter()
            .filter_map(|id| chain.tokens.get(id).map(|info| (id.clone(), info.clone())))
            .collect())
    }

    async fn fetch_mint_metadata(
        &self,
        _network_id: i64,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<serde_json::Value>>> {
        self.check_tokens_online()?;
        let chain = self.chain.lock();
        Ok(ids
            .iter()
            .filter_map(|id| chain.mint_events.get(id).map(|e| (id.clone(), e.clone())))
            .collect())
    }

    async fn fetch_supply(&self, _network_id: i64, ids: &[String]) -> Result<HashMap<String, String>> {
        self.check_tokens_online()?;
        let chain = self.chain.lock();
        Ok(ids
            .iter()
            .filter_map(|id| chain.supply.get(id).map(|s| (id.clone(), s.clone())))
            .collect())
    }

    async fn check_addresses_in_use(&self, addresses: &[String]) -> Result<HashSet<String>> {
        self.check_online()?;
        let chain = self.chain.lock();
        let mut used = HashSet::new();
        for address in addresses {
            let single: HashSet<&str> = std::iter::once(address.as_str()).collect();
            if chain
                .transactions
                .iter()
                .any(|t| ChainFixture::touches(t, &single))
            {
                used.insert(address.clone());
            }
        }
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RemoteBlock, RemoteOutput, RemoteTxState};

    const OWNER: &str = "61aa";

    fn tx(hash: &str, height: Option<u64>) -> RemoteTransaction {
        RemoteTransaction {
            hash: hash.to_string(),
            state: if height.is_some() {
                RemoteTxState::Successful
            } else {
                RemoteTxState::Pending
            },
            block: height.map(|h| RemoteBlock {
                hash: format!("b{h}"),
                height: h,
                slot: h,
                epoch: None,
                time: 0,
            }),
            ordinal: Some(0),
            error_message: None,
            fee: None,
            is_valid: true,
            inputs: vec![],
            outputs: vec![RemoteOutput {
                address: OWNER.to_string(),
                amount: "1".to_string(),
                assets: vec![],
            }],
            withdrawals: vec![],
            certificates: vec![],
        }
    }

    fn chain() -> ChainFixture {
        ChainFixture {
            best_block: BestBlock {
                hash: "b100".to_string(),
                height: 100,
                ..Default::default()
            },
            // Deliberately unordered
            transactions: vec![tx("t3", Some(30)), tx("p1", None), tx("t1", Some(10)), tx("t2", Some(20))],
            ..Default::default()
        }
    }

    fn request(anchor: Option<HistoryAnchor>, limit: usize) -> HistoryRequest {
        HistoryRequest {
            addresses: vec![OWNER.to_string()],
            anchor,
            until_block: "b100".to_string(),
            limit,
        }
    }

    fn hashes(txs: &[RemoteTransaction]) -> Vec<&str> {
        txs.iter().map(|t| t.hash.as_str()).collect()
    }

    fn after(block: &str, tx: &str) -> Option<HistoryAnchor> {
        Some(HistoryAnchor::After(TxPointer {
            block_hash: block.to_string(),
            tx_hash: Some(tx.to_string()),
        }))
    }

    #[test]
    fn test_unanchored_returns_newest_with_unconfirmed_last() {
        let page = chain().history(&request(None, 3)).unwrap();
        assert_eq!(hashes(&page), vec!["t2", "t3", "p1"]);
    }

    #[test]
    fn test_after_anchor_returns_oldest_first() {
        let page = chain().history(&request(after("b10", "t1"), 1)).unwrap();
        assert_eq!(hashes(&page), vec!["t2"]);
        let page = chain().history(&request(after("b20", "t2"), 10)).unwrap();
        assert_eq!(hashes(&page), vec!["t3", "p1"]);
    }

    #[test]
    fn test_before_anchor_returns_newest_older_transactions() {
        let anchor = Some(HistoryAnchor::Before(TxPointer {
            block_hash: "b30".to_string(),
            tx_hash: Some("t3".to_string()),
        }));
        let page = chain().history(&request(anchor, 1)).unwrap();
        assert_eq!(hashes(&page), vec!["t2"]);
    }

    #[test]
    fn test_unknown_anchor_block_requires_rollback() {
        let err = chain().history(&request(after("b15", "gone"), 5)).unwrap_err();
        assert!(matches!(err, Error::RollbackRequired(_)));
    }

    #[test]
    fn test_other_addresses_are_filtered() {
        let mut request = request(None, 10);
        request.addresses = vec!["61bb".to_string()];
        assert!(chain().history(&request).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_switches() {
        let remote = FixtureRemote::new(chain());
        remote.set_tokens_offline(true);
        assert!(remote.fetch_best_block(1).await.is_ok());
        assert!(matches!(
            remote.fetch_token_info(1, &["x".to_string()]).await,
            Err(Error::Network(_))
        ));
        remote.set_offline(true);
        assert!(remote.fetch_best_block(1).await.is_err());
        assert!(remote.fetch_history(&request(None, 1)).await.is_err());
        assert_eq!(remote.history_calls(), 1);
    }
}
