//! Shapes of the data returned by the remote indexer
//!
//! Everything derives `Deserialize` so recorded responses can be replayed
//! from JSON.

use ledger_storage_sqlite::{BlockInfo, TxStatus, PRIMARY_ASSET_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Block as reported by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBlock {
    /// Block hash
    pub hash: String,
    /// Height
    pub height: u64,
    /// Absolute slot
    pub slot: u64,
    /// Epoch, when the chain has them
    #[serde(default)]
    pub epoch: Option<u64>,
    /// Block time (unix seconds)
    #[serde(default)]
    pub time: i64,
}

impl RemoteBlock {
    /// Stored representation
    pub fn to_info(&self) -> BlockInfo {
        BlockInfo {
            hash: self.hash.clone(),
            height: self.height,
            slot: self.slot,
            time: self.time,
        }
    }
}

/// Remote view of a transaction's fate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTxState {
    /// In the mempool
    Pending,
    /// Included in a block
    Successful,
    /// Rejected by the node
    Failed,
}

/// Amount of one native asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAsset {
    /// Asset identifier (policy id + name, or token id)
    pub asset_id: String,
    /// Decimal amount in base units
    pub amount: String,
}

/// Consumed output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInput {
    /// Address that owned the consumed output
    pub address: String,
    /// Hash of the transaction that created it
    pub tx_hash: String,
    /// Output index inside that transaction
    pub index: u32,
    /// Primary asset amount
    pub amount: String,
    /// Native assets
    #[serde(default)]
    pub assets: Vec<RemoteAsset>,
}

/// Created output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOutput {
    /// Receiving address
    pub address: String,
    /// Primary asset amount
    pub amount: String,
    /// Native assets
    #[serde(default)]
    pub assets: Vec<RemoteAsset>,
}

/// Reward withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWithdrawal {
    /// Reward address
    pub address: String,
    /// Withdrawn amount
    pub amount: String,
}

/// Stake pool registration parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParams {
    /// Operator key hash
    pub operator: String,
    /// VRF key hash
    #[serde(default)]
    pub vrf_keyhash: String,
    /// Pledge
    #[serde(default)]
    pub pledge: String,
    /// Fixed cost
    #[serde(default)]
    pub cost: String,
    /// Margin as a fraction string
    #[serde(default)]
    pub margin: String,
    /// Reward account (reward address)
    pub reward_account: String,
    /// Owner key hashes
    #[serde(default)]
    pub pool_owners: Vec<String>,
    /// Relays and metadata, kept opaque
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

/// Chain certificate as delivered by the remote.
///
/// `stake_credential` fields are reward addresses of the delegator; key
/// hash fields are raw 28-byte credentials in hex.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteCertificate {
    StakeRegistration {
        stake_credential: String,
    },
    StakeDeregistration {
        stake_credential: String,
    },
    StakeDelegation {
        stake_credential: String,
        pool_keyhash: String,
    },
    PoolRegistration {
        pool_params: PoolParams,
    },
    PoolRetirement {
        pool_keyhash: String,
        epoch: u64,
    },
    GenesisKeyDelegation {
        genesis_hash: String,
        genesis_delegate_hash: String,
        vrf_keyhash: String,
    },
    MoveInstantaneousRewards {
        pot: String,
        /// Reward address to amount
        #[serde(default)]
        rewards: BTreeMap<String, String>,
    },
    RegistrationWithDeposit {
        stake_credential: String,
        deposit: String,
    },
    DeregistrationWithRefund {
        stake_credential: String,
        refund: String,
    },
    VoteDelegation {
        stake_credential: String,
        drep: String,
    },
    StakeVoteDelegation {
        stake_credential: String,
        pool_keyhash: String,
        drep: String,
    },
    StakeRegistrationDelegation {
        stake_credential: String,
        pool_keyhash: String,
        deposit: String,
    },
    VoteRegistrationDelegation {
        stake_credential: String,
        drep: String,
        deposit: String,
    },
    StakeVoteRegistrationDelegation {
        stake_credential: String,
        pool_keyhash: String,
        drep: String,
        deposit: String,
    },
    AuthCommitteeHot {
        committee_cold_keyhash: String,
        committee_hot_keyhash: String,
    },
    ResignCommitteeCold {
        committee_cold_keyhash: String,
        #[serde(default)]
        anchor: Option<serde_json::Value>,
    },
    DrepRegistration {
        drep_keyhash: String,
        deposit: String,
        #[serde(default)]
        anchor: Option<serde_json::Value>,
    },
    DrepDeregistration {
        drep_keyhash: String,
        refund: String,
    },
    DrepUpdate {
        drep_keyhash: String,
        #[serde(default)]
        anchor: Option<serde_json::Value>,
    },
}

/// Transaction as delivered by the remote history endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTransaction {
    /// Transaction hash
    pub hash: String,
    /// Remote state
    pub state: RemoteTxState,
    /// Containing block, for confirmed transactions
    #[serde(default)]
    pub block: Option<RemoteBlock>,
    /// Position inside the block
    #[serde(default)]
    pub ordinal: Option<u32>,
    /// Node error for failed submissions
    #[serde(default)]
    pub error_message: Option<String>,
    /// Fee, on chains that report one
    #[serde(default)]
    pub fee: Option<String>,
    /// Phase-2 validity (Cardano)
    #[serde(default = "default_valid")]
    pub is_valid: bool,
    /// Consumed outputs
    #[serde(default)]
    pub inputs: Vec<RemoteInput>,
    /// Created outputs
    #[serde(default)]
    pub outputs: Vec<RemoteOutput>,
    /// Reward withdrawals
    #[serde(default)]
    pub withdrawals: Vec<RemoteWithdrawal>,
    /// Certificates in transaction order
    #[serde(default)]
    pub certificates: Vec<RemoteCertificate>,
}

fn default_valid() -> bool {
    true
}

impl RemoteTransaction {
    /// Status the transaction should be stored with
    pub fn status(&self) -> TxStatus {
        match (self.state, &self.block) {
            (RemoteTxState::Successful, Some(_)) => TxStatus::InBlock,
            (RemoteTxState::Successful, None) | (RemoteTxState::Pending, _) => TxStatus::Pending,
            (RemoteTxState::Failed, _) => TxStatus::FailResponse,
        }
    }

    /// Confirmed in a block
    pub fn is_confirmed(&self) -> bool {
        self.status() == TxStatus::InBlock
    }

    /// Every native asset identifier referenced, without duplicates
    pub fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inputs
            .iter()
            .flat_map(|i| i.assets.iter())
            .chain(self.outputs.iter().flat_map(|o| o.assets.iter()))
            .map(|a| a.asset_id.clone())
            .filter(|id| id != PRIMARY_ASSET_ID)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Every address of inputs, outputs and withdrawals
    pub fn addresses(&self) -> Vec<String> {
        self.inputs
            .iter()
            .map(|i| i.address.clone())
            .chain(self.outputs.iter().map(|o| o.address.clone()))
            .chain(self.withdrawals.iter().map(|w| w.address.clone()))
            .collect()
    }
}

/// Chain tip
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestBlock {
    /// Block hash
    pub hash: String,
    /// Height
    pub height: u64,
    /// Absolute slot
    pub slot: u64,
    /// Epoch
    #[serde(default)]
    pub epoch: Option<u64>,
    /// Block time (unix seconds)
    #[serde(default)]
    pub time: i64,
}

impl BestBlock {
    /// Stored representation
    pub fn to_info(&self) -> BlockInfo {
        BlockInfo {
            hash: self.hash.clone(),
            height: self.height,
            slot: self.slot,
            time: self.time,
        }
    }
}

/// Display metadata of an asset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Decimal places
    #[serde(default)]
    pub decimals: Option<u8>,
    /// Ticker
    #[serde(default)]
    pub ticker: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Logo (URL or base64)
    #[serde(default)]
    pub logo: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let mut tx: RemoteTransaction = serde_json::from_value(serde_json::json!({
            "hash": "aa",
            "state": "successful",
            "block": { "hash": "bb", "height": 10, "slot": 200 }
        }))
        .unwrap();
        assert_eq!(tx.status(), TxStatus::InBlock);
        assert!(tx.is_valid);

        tx.block = None;
        assert_eq!(tx.status(), TxStatus::Pending);

        tx.state = RemoteTxState::Failed;
        assert_eq!(tx.status(), TxStatus::FailResponse);
    }

    #[test]
    fn test_certificate_tagging() {
        let cert: RemoteCertificate = serde_json::from_value(serde_json::json!({
            "kind": "stake_delegation",
            "stake_credential": "e1aa",
            "pool_keyhash": "bb"
        }))
        .unwrap();
        assert_eq!(
            cert,
            RemoteCertificate::StakeDelegation {
                stake_credential: "e1aa".into(),
                pool_keyhash: "bb".into()
            }
        );
    }

    #[test]
    fn test_asset_ids_are_deduplicated() {
        let tx: RemoteTransaction = serde_json::from_value(serde_json::json!({
            "hash": "aa",
            "state": "pending",
            "outputs": [
                { "address": "x", "amount": "1", "assets": [{ "asset_id": "p.b", "amount": "1" }] },
                { "address": "y", "amount": "1", "assets": [
                    { "asset_id": "p.a", "amount": "2" },
                    { "asset_id": "p.b", "amount": "3" }
                ] }
            ]
        }))
        .unwrap();
        assert_eq!(tx.asset_ids(), vec!["p.a".to_string(), "p.b".to_string()]);
    }
}
