//! Data models

use crate::{Error, Result};
use ledger_params::ChainProtocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wallet account surrogate id
pub type AccountId = i64;
/// Address surrogate id
pub type AddressId = i64;
/// Block surrogate id
pub type BlockId = i64;
/// Transaction surrogate id
pub type TransactionId = i64;
/// Token surrogate id
pub type TokenId = i64;
/// Token list id shared by every entry of one list
pub type ListId = i64;

/// Identifier of the chain's primary asset in the token catalog
pub const PRIMARY_ASSET_ID: &str = "";

/// Capabilities of a wallet account, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    /// Plain UTXO wallet
    Utxo,
    /// UTXO wallet with a reward (accounting) address
    UtxoAndAccounting,
}

impl WalletKind {
    /// Column value
    pub const fn as_str(&self) -> &'static str {
        match self {
            WalletKind::Utxo => "utxo",
            WalletKind::UtxoAndAccounting => "utxo_and_accounting",
        }
    }

    /// Parse a column value
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "utxo" => Ok(WalletKind::Utxo),
            "utxo_and_accounting" => Ok(WalletKind::UtxoAndAccounting),
            other => Err(Error::Validation(format!("unknown wallet kind {other}"))),
        }
    }

    /// Whether withdrawals and certificates apply
    pub const fn has_accounting(&self) -> bool {
        matches!(self, WalletKind::UtxoAndAccounting)
    }
}

/// Wallet account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAccount {
    /// Account id
    pub id: AccountId,
    /// Display name
    pub name: String,
    /// Network id (see `ledger_params::Network`)
    pub network_id: i64,
    /// Account kind
    pub kind: WalletKind,
    /// Creation timestamp (unix seconds)
    pub created_at: i64,
}

/// Transaction state.
///
/// Negative codes are dead states; a transaction only leaves a dead state
/// when the remote reports it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Pending locally but absent from the remote history
    NotInRemote,
    /// Reverted by a chain rollback
    RollbackFail,
    /// Rejected by the remote
    FailResponse,
    /// Submitted, not yet in a block
    Pending,
    /// Confirmed in a block
    InBlock,
}

impl TxStatus {
    /// Column value
    pub const fn code(&self) -> i32 {
        match self {
            TxStatus::NotInRemote => -3,
            TxStatus::RollbackFail => -2,
            TxStatus::FailResponse => -1,
            TxStatus::Pending => 0,
            TxStatus::InBlock => 1,
        }
    }

    /// Parse a column value
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            -3 => Ok(TxStatus::NotInRemote),
            -2 => Ok(TxStatus::RollbackFail),
            -1 => Ok(TxStatus::FailResponse),
            0 => Ok(TxStatus::Pending),
            1 => Ok(TxStatus::InBlock),
            other => Err(Error::Validation(format!("unknown transaction status {other}"))),
        }
    }

    /// Pending or in a block; its inputs consume outputs
    pub const fn is_live(&self) -> bool {
        matches!(self, TxStatus::Pending | TxStatus::InBlock)
    }
}

/// Address encoding family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    /// Byron bootstrap address (base58 CBOR)
    CardanoLegacy,
    /// Shelley base address (payment + stake)
    CardanoBase,
    /// Shelley pointer address
    CardanoPointer,
    /// Shelley enterprise address (payment only)
    CardanoEnterprise,
    /// Shelley reward (stake) address
    CardanoReward,
    /// Ergo pay-to-public-key
    ErgoP2pk,
    /// Ergo pay-to-script-hash
    ErgoP2sh,
    /// Ergo pay-to-script
    ErgoP2s,
}

impl AddressType {
    /// Column value
    pub const fn code(&self) -> i32 {
        match self {
            AddressType::CardanoLegacy => 0,
            AddressType::CardanoBase => 1,
            AddressType::CardanoPointer => 2,
            AddressType::CardanoEnterprise => 3,
            AddressType::CardanoReward => 4,
            AddressType::ErgoP2pk => 10,
            AddressType::ErgoP2sh => 11,
            AddressType::ErgoP2s => 12,
        }
    }

    /// Parse a column value
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(AddressType::CardanoLegacy),
            1 => Ok(AddressType::CardanoBase),
            2 => Ok(AddressType::CardanoPointer),
            3 => Ok(AddressType::CardanoEnterprise),
            4 => Ok(AddressType::CardanoReward),
            10 => Ok(AddressType::ErgoP2pk),
            11 => Ok(AddressType::ErgoP2sh),
            12 => Ok(AddressType::ErgoP2s),
            other => Err(Error::Validation(format!("unknown address type {other}"))),
        }
    }

    /// Detect the type of a raw address string.
    ///
    /// Shelley addresses are stored as hex of the raw bytes (header nibble
    /// carries the type); Byron and Ergo addresses are base58.
    pub fn detect(protocol: ChainProtocol, address: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("unrecognized address {address}"));
        match protocol {
            ChainProtocol::Cardano => {
                if let Ok(bytes) = hex::decode(address) {
                    let header = *bytes.first().ok_or_else(invalid)?;
                    return match header >> 4 {
                        0..=3 => Ok(AddressType::CardanoBase),
                        4 | 5 => Ok(AddressType::CardanoPointer),
                        6 | 7 => Ok(AddressType::CardanoEnterprise),
                        8 => Ok(AddressType::CardanoLegacy),
                        14 | 15 => Ok(AddressType::CardanoReward),
                        _ => Err(invalid()),
                    };
                }
                let bytes = bs58::decode(address).into_vec().map_err(|_| invalid())?;
                // Byron addresses are a CBOR array of two elements
                match bytes.first() {
                    Some(0x82) => Ok(AddressType::CardanoLegacy),
                    _ => Err(invalid()),
                }
            }
            ChainProtocol::Ergo => {
                let bytes = bs58::decode(address).into_vec().map_err(|_| invalid())?;
                match bytes.first().map(|b| b & 0x0f) {
                    Some(1) => Ok(AddressType::ErgoP2pk),
                    Some(2) => Ok(AddressType::ErgoP2sh),
                    Some(3) => Ok(AddressType::ErgoP2s),
                    _ => Err(invalid()),
                }
            }
        }
    }
}

/// Stored address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    /// Address id
    pub id: AddressId,
    /// Raw address string
    pub hash: String,
    /// Digest of `hash`
    pub digest: i64,
    /// Encoding family
    pub address_type: AddressType,
    /// Referenced by at least one stored input or output
    pub is_used: bool,
}

/// Block header fields kept locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Block hash
    pub hash: String,
    /// Block height
    pub height: u64,
    /// Absolute slot
    pub slot: u64,
    /// Block timestamp (unix seconds)
    pub time: i64,
}

/// Stored block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    /// Block id
    pub id: BlockId,
    /// Header fields
    pub info: BlockInfo,
}

/// Chain specific transaction payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum TransactionExtra {
    /// Cardano fee and phase-2 validity
    Cardano {
        /// Fee in the primary asset's base unit
        fee: String,
        /// False when collateral was consumed instead of inputs
        is_valid: bool,
    },
    /// Ergo carries no extra data
    Ergo,
}

/// Stored transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRow {
    /// Transaction id
    pub id: TransactionId,
    /// Transaction hash
    pub hash: String,
    /// Digest of `hash`
    pub digest: i64,
    /// Network id
    pub network_id: i64,
    /// Containing block, if confirmed
    pub block: Option<BlockRow>,
    /// Position within the block
    pub ordinal: Option<u32>,
    /// Current state
    pub status: TxStatus,
    /// Last state change (unix seconds)
    pub last_update: i64,
    /// Remote error for failed submissions
    pub error_message: Option<String>,
    /// Chain specific payload
    pub extra: Option<TransactionExtra>,
}

impl TransactionRow {
    /// Height of the containing block
    pub fn height(&self) -> Option<u64> {
        self.block.as_ref().map(|b| b.info.height)
    }
}

/// New transaction row
#[derive(Debug, Clone)]
pub struct NewTransaction {
    /// Transaction hash
    pub hash: String,
    /// Network id
    pub network_id: i64,
    /// Containing block
    pub block_id: Option<BlockId>,
    /// Position within the block
    pub ordinal: Option<u32>,
    /// Initial state
    pub status: TxStatus,
    /// Remote error message
    pub error_message: Option<String>,
    /// Chain specific payload
    pub extra: Option<TransactionExtra>,
}

/// New UTXO input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUtxoInput {
    /// Owning address
    pub address_id: AddressId,
    /// Hash of the transaction that produced the consumed output
    pub parent_tx_hash: String,
    /// Index of the consumed output
    pub parent_index: u32,
    /// Position of the input
    pub input_index: u32,
    /// Assets carried
    pub token_list_id: ListId,
}

/// New UTXO output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUtxoOutput {
    /// Receiving address
    pub address_id: AddressId,
    /// Output index
    pub output_index: u32,
    /// Assets carried
    pub token_list_id: ListId,
}

/// New accounting (withdrawal) input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccountingInput {
    /// Reward address
    pub address_id: AddressId,
    /// Synthetic spending counter
    pub spending_counter: u64,
    /// Position among the transaction's withdrawals
    pub input_index: u32,
    /// Amount withdrawn
    pub token_list_id: ListId,
}

/// Stored UTXO input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoInputRow {
    /// Row id
    pub id: i64,
    /// Spending transaction
    pub transaction_id: TransactionId,
    /// Input fields
    pub input: NewUtxoInput,
}

/// Stored UTXO output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoOutputRow {
    /// Row id
    pub id: i64,
    /// Producing transaction
    pub transaction_id: TransactionId,
    /// Output fields
    pub output: NewUtxoOutput,
    /// Not consumed by any live stored input
    pub is_unspent: bool,
}

/// Stored accounting input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingInputRow {
    /// Row id
    pub id: i64,
    /// Withdrawing transaction
    pub transaction_id: TransactionId,
    /// Input fields
    pub input: NewAccountingInput,
}

/// Certificate kinds across protocol eras
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateKind {
    /// Stake key registration
    StakeRegistration,
    /// Stake key deregistration
    StakeDeregistration,
    /// Stake delegation to a pool
    StakeDelegation,
    /// Pool registration or update
    PoolRegistration,
    /// Pool retirement
    PoolRetirement,
    /// Genesis key delegation
    GenesisKeyDelegation,
    /// Move instantaneous rewards
    MoveInstantaneousRewards,
    /// Registration with explicit deposit
    RegistrationWithDeposit,
    /// Deregistration with explicit refund
    DeregistrationWithRefund,
    /// Vote delegation to a DRep
    VoteDelegation,
    /// Stake and vote delegation
    StakeVoteDelegation,
    /// Registration plus stake delegation
    StakeRegistrationDelegation,
    /// Registration plus vote delegation
    VoteRegistrationDelegation,
    /// Registration plus stake and vote delegation
    StakeVoteRegistrationDelegation,
    /// Committee hot key authorization
    AuthCommitteeHot,
    /// Committee cold key resignation
    ResignCommitteeCold,
    /// DRep registration
    DrepRegistration,
    /// DRep deregistration
    DrepDeregistration,
    /// DRep metadata update
    DrepUpdate,
}

impl CertificateKind {
    const ALL: [CertificateKind; 19] = [
        CertificateKind::StakeRegistration,
        CertificateKind::StakeDeregistration,
        CertificateKind::StakeDelegation,
        CertificateKind::PoolRegistration,
        CertificateKind::PoolRetirement,
        CertificateKind::GenesisKeyDelegation,
        CertificateKind::MoveInstantaneousRewards,
        CertificateKind::RegistrationWithDeposit,
        CertificateKind::DeregistrationWithRefund,
        CertificateKind::VoteDelegation,
        CertificateKind::StakeVoteDelegation,
        CertificateKind::StakeRegistrationDelegation,
        CertificateKind::VoteRegistrationDelegation,
        CertificateKind::StakeVoteRegistrationDelegation,
        CertificateKind::AuthCommitteeHot,
        CertificateKind::ResignCommitteeCold,
        CertificateKind::DrepRegistration,
        CertificateKind::DrepDeregistration,
        CertificateKind::DrepUpdate,
    ];

    /// Column value
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Parse a column value
    pub fn from_code(code: i32) -> Result<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| Error::Validation(format!("unknown certificate kind {code}")))
    }
}

/// Relation between a certificate and an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateRole {
    /// Key that signed the certificate
    Signer,
    /// Pool owner
    Owner,
    /// Pool operator
    Operator,
    /// Pool or genesis key
    PoolKey,
    /// Reward destination
    RewardAddress,
}

impl CertificateRole {
    /// Column value
    pub const fn code(&self) -> i32 {
        match self {
            CertificateRole::Signer => 0,
            CertificateRole::Owner => 1,
            CertificateRole::Operator => 2,
            CertificateRole::PoolKey => 3,
            CertificateRole::RewardAddress => 4,
        }
    }

    /// Parse a column value
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(CertificateRole::Signer),
            1 => Ok(CertificateRole::Owner),
            2 => Ok(CertificateRole::Operator),
            3 => Ok(CertificateRole::PoolKey),
            4 => Ok(CertificateRole::RewardAddress),
            other => Err(Error::Validation(format!("unknown certificate role {other}"))),
        }
    }
}

/// Normalized certificate ready for storage
#[derive(Debug, Clone, PartialEq)]
pub struct NewCertificate {
    /// Position within the transaction
    pub ordinal: u32,
    /// Kind
    pub kind: CertificateKind,
    /// Opaque protocol payload
    pub payload: serde_json::Value,
    /// Related local addresses
    pub relations: Vec<(AddressId, CertificateRole)>,
}

/// Stored certificate
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRow {
    /// Certificate id
    pub id: i64,
    /// Carrying transaction
    pub transaction_id: TransactionId,
    /// Certificate fields
    pub certificate: NewCertificate,
}

/// Cached asset metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    /// Display decimals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
    /// Ticker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Logo (URL or base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    /// Metadata attached to the mint event(s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mint_metadata: Option<serde_json::Value>,
    /// Circulating supply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supply: Option<String>,
}

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRow {
    /// Token id
    pub id: TokenId,
    /// Network id
    pub network_id: i64,
    /// Asset identifier (empty for the primary asset)
    pub identifier: String,
    /// Primary asset of the network
    pub is_default: bool,
    /// Single-mint asset with supply 1
    pub is_nft: bool,
    /// Cached metadata
    pub metadata: TokenMetadata,
    /// Last metadata refresh (unix seconds), `None` if never fetched
    pub last_updated: Option<i64>,
}

/// One (asset, amount) entry of a token list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenListEntry {
    /// Token id
    pub token_id: TokenId,
    /// Asset identifier
    pub identifier: String,
    /// Amount in base units
    pub amount: u128,
}

/// Amount of one asset, as exchanged with the remote and kept in snapshots
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetAmount {
    /// Asset identifier
    pub identifier: String,
    /// Amount in base units (decimal string)
    pub amount: String,
}

/// Multi-asset amount keyed by identifier; always carries the primary asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiToken {
    amounts: BTreeMap<String, u128>,
}

impl Default for MultiToken {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiToken {
    /// Zero primary asset
    pub fn new() -> Self {
        let mut amounts = BTreeMap::new();
        amounts.insert(PRIMARY_ASSET_ID.to_string(), 0);
        Self { amounts }
    }

    /// Add `amount` of `identifier`
    pub fn add(&mut self, identifier: &str, amount: u128) {
        let entry = self.amounts.entry(identifier.to_string()).or_insert(0);
        *entry = entry.saturating_add(amount);
    }

    /// Add every entry of `other`
    pub fn join(&mut self, other: &MultiToken) {
        for (identifier, amount) in &other.amounts {
            self.add(identifier, *amount);
        }
    }

    /// Amount of `identifier` (zero if absent)
    pub fn get(&self, identifier: &str) -> u128 {
        self.amounts.get(identifier).copied().unwrap_or(0)
    }

    /// Amount of the primary asset
    pub fn primary(&self) -> u128 {
        self.get(PRIMARY_ASSET_ID)
    }

    /// Entries in identifier order, primary asset first
    pub fn iter(&self) -> impl Iterator<Item = (&str, u128)> {
        self.amounts.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Rollback anchor of an account
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LastSyncInfo {
    /// Last confirmed block hash, `None` before the first sync
    pub block_hash: Option<String>,
    /// Last confirmed block height
    pub height: u64,
    /// Last confirmed block slot
    pub slot: Option<u64>,
    /// Last confirmed block time (unix seconds)
    pub time: Option<i64>,
}

impl LastSyncInfo {
    /// Anchor pointing at `block`
    pub fn at(block: &BlockInfo) -> Self {
        Self {
            block_hash: Some(block.hash.clone()),
            height: block.height,
            slot: Some(block.slot),
            time: Some(block.time),
        }
    }

    /// No confirmed sync point yet
    pub fn is_empty(&self) -> bool {
        self.block_hash.is_none()
    }
}

/// One unspent output in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    /// `{tx_hash}{tx_index}`
    pub utxo_id: String,
    /// Producing transaction hash
    pub tx_hash: String,
    /// Output index
    pub tx_index: u32,
    /// Receiving address
    pub receiver: String,
    /// Primary asset amount
    pub amount: String,
    /// Other assets
    #[serde(default)]
    pub assets: Vec<AssetAmount>,
    /// Height of the producing block
    pub block_height: u64,
}

impl UtxoEntry {
    /// Snapshot key of an output
    pub fn make_id(tx_hash: &str, tx_index: u32) -> String {
        format!("{tx_hash}{tx_index}")
    }
}

/// Incremental change to the UTXO set up to a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoDiff {
    /// Best block the diff brings the set up to
    pub last_best_block_hash: String,
    /// Height of that block
    pub block_height: u64,
    /// Removed utxo ids
    pub spent_utxo_ids: Vec<String>,
    /// Added utxos
    pub new_utxos: Vec<UtxoEntry>,
}

impl UtxoDiff {
    /// Whether the diff changes nothing
    pub fn is_empty(&self) -> bool {
        self.spent_utxo_ids.is_empty() && self.new_utxos.is_empty()
    }
}

/// Full UTXO set as of a final block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePoint {
    /// Block hash
    pub block_hash: String,
    /// Block height
    pub block_height: u64,
    /// Hash of the address set the snapshot was taken for
    pub address_set_hash: String,
    /// Unspent outputs
    pub utxos: Vec<UtxoEntry>,
}

/// Unspent output owned by an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    /// Output row id
    pub output_id: i64,
    /// Producing transaction hash
    pub tx_hash: String,
    /// Output index
    pub output_index: u32,
    /// Receiving address
    pub address: String,
    /// Height of the producing block
    pub block_height: u64,
    /// Assets carried
    pub tokens: MultiToken,
}

impl UnspentOutput {
    /// Snapshot representation
    pub fn to_entry(&self) -> UtxoEntry {
        UtxoEntry {
            utxo_id: UtxoEntry::make_id(&self.tx_hash, self.output_index),
            tx_hash: self.tx_hash.clone(),
            tx_index: self.output_index,
            receiver: self.address.clone(),
            amount: self.tokens.primary().to_string(),
            assets: self
                .tokens
                .iter()
                .filter(|(id, _)| !id.is_empty())
                .map(|(identifier, amount)| AssetAmount {
                    identifier: identifier.to_string(),
                    amount: amount.to_string(),
                })
                .collect(),
            block_height: self.block_height,
        }
    }
}

/// Input or output as shown in history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryIo {
    /// Address
    pub address: String,
    /// Assets moved
    pub tokens: MultiToken,
}

/// One transaction as shown in history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Transaction
    pub transaction: TransactionRow,
    /// UTXO inputs
    pub inputs: Vec<HistoryIo>,
    /// UTXO outputs
    pub outputs: Vec<HistoryIo>,
    /// Withdrawals
    pub withdrawals: Vec<HistoryIo>,
    /// Certificates
    pub certificates: Vec<CertificateRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            TxStatus::NotInRemote,
            TxStatus::RollbackFail,
            TxStatus::FailResponse,
            TxStatus::Pending,
            TxStatus::InBlock,
        ] {
            assert_eq!(TxStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(TxStatus::from_code(7).is_err());
        assert!(!TxStatus::RollbackFail.is_live());
        assert!(TxStatus::Pending.is_live());
    }

    #[test]
    fn test_certificate_kind_codes() {
        for kind in CertificateKind::ALL {
            assert_eq!(CertificateKind::from_code(kind.code()).unwrap(), kind);
        }
        assert!(CertificateKind::from_code(-1).is_err());
        assert!(CertificateKind::from_code(19).is_err());
    }

    #[test]
    fn test_detect_shelley_address_types() {
        let key = "00".repeat(28);
        let base = format!("01{key}{key}");
        let enterprise = format!("61{key}");
        let reward = format!("e1{key}");
        let pointer = format!("41{key}8101");
        assert_eq!(
            AddressType::detect(ChainProtocol::Cardano, &base).unwrap(),
            AddressType::CardanoBase
        );
        assert_eq!(
            AddressType::detect(ChainProtocol::Cardano, &enterprise).unwrap(),
            AddressType::CardanoEnterprise
        );
        assert_eq!(
            AddressType::detect(ChainProtocol::Cardano, &reward).unwrap(),
            AddressType::CardanoReward
        );
        assert_eq!(
            AddressType::detect(ChainProtocol::Cardano, &pointer).unwrap(),
            AddressType::CardanoPointer
        );
    }

    #[test]
    fn test_detect_base58_address_types() {
        let byron = bs58::encode([0x82u8, 0xd8, 0x18, 0x58]).into_string();
        assert_eq!(
            AddressType::detect(ChainProtocol::Cardano, &byron).unwrap(),
            AddressType::CardanoLegacy
        );

        let p2pk = bs58::encode([0x01u8, 0x02, 0x03]).into_string();
        let p2s = bs58::encode([0x03u8, 0x02, 0x03]).into_string();
        assert_eq!(
            AddressType::detect(ChainProtocol::Ergo, &p2pk).unwrap(),
            AddressType::ErgoP2pk
        );
        assert_eq!(
            AddressType::detect(ChainProtocol::Ergo, &p2s).unwrap(),
            AddressType::ErgoP2s
        );
        assert!(AddressType::detect(ChainProtocol::Ergo, "0OIl").is_err());
    }

    #[test]
    fn test_multi_token_always_has_primary() {
        let mut tokens = MultiToken::new();
        assert_eq!(tokens.iter().count(), 1);
        tokens.add("policy.asset", 5);
        tokens.add(PRIMARY_ASSET_ID, 10);
        tokens.add("policy.asset", 2);
        assert_eq!(tokens.primary(), 10);
        assert_eq!(tokens.get("policy.asset"), 7);
        assert_eq!(tokens.iter().next().unwrap().0, PRIMARY_ASSET_ID);
    }

    #[test]
    fn test_extra_serialization_is_tagged() {
        let extra = TransactionExtra::Cardano {
            fee: "170000".to_string(),
            is_valid: true,
        };
        let json = serde_json::to_string(&extra).unwrap();
        assert!(json.contains("\"protocol\":\"cardano\""));
        assert_eq!(serde_json::from_str::<TransactionExtra>(&json).unwrap(), extra);
    }
}
