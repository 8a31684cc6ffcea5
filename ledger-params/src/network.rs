//! Network definitions

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Chain protocol family spoken by a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainProtocol {
    /// Byron/Shelley-era chain: UTXO transfers plus account-style staking
    /// (reward withdrawals, delegation certificates).
    Cardano,
    /// Pure UTXO chain with native tokens carried in boxes.
    Ergo,
}

impl ChainProtocol {
    /// Whether the protocol has account-style balance movements.
    pub const fn has_accounting(&self) -> bool {
        matches!(self, Self::Cardano)
    }
}

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    /// Cardano mainnet
    CardanoMainnet,
    /// Cardano pre-production testnet
    CardanoPreprod,
    /// Cardano preview testnet
    CardanoPreview,
    /// Ergo mainnet
    ErgoMainnet,
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Numeric id persisted in the store
    pub id: i64,
    /// Chain protocol family
    pub protocol: ChainProtocol,
    /// Network tag embedded in address headers (Cardano only)
    pub address_network_tag: u8,
    /// Ticker of the primary asset
    pub primary_ticker: &'static str,
    /// Decimal places of the primary asset
    pub primary_decimals: u8,
}

impl Network {
    /// Get Cardano mainnet parameters
    pub const fn cardano_mainnet() -> Self {
        Self {
            network_type: NetworkType::CardanoMainnet,
            name: "cardano-mainnet",
            id: 1,
            protocol: ChainProtocol::Cardano,
            address_network_tag: 1,
            primary_ticker: "ADA",
            primary_decimals: 6,
        }
    }

    /// Get Cardano preprod parameters
    pub const fn cardano_preprod() -> Self {
        Self {
            network_type: NetworkType::CardanoPreprod,
            name: "cardano-preprod",
            id: 250,
            protocol: ChainProtocol::Cardano,
            address_network_tag: 0,
            primary_ticker: "TADA",
            primary_decimals: 6,
        }
    }

    /// Get Cardano preview parameters
    pub const fn cardano_preview() -> Self {
        Self {
            network_type: NetworkType::CardanoPreview,
            name: "cardano-preview",
            id: 350,
            protocol: ChainProtocol::Cardano,
            address_network_tag: 0,
            primary_ticker: "TADA",
            primary_decimals: 6,
        }
    }

    /// Get Ergo mainnet parameters
    pub const fn ergo_mainnet() -> Self {
        Self {
            network_type: NetworkType::ErgoMainnet,
            name: "ergo-mainnet",
            id: 200,
            protocol: ChainProtocol::Ergo,
            address_network_tag: 0,
            primary_ticker: "ERG",
            primary_decimals: 9,
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::CardanoMainnet => Self::cardano_mainnet(),
            NetworkType::CardanoPreprod => Self::cardano_preprod(),
            NetworkType::CardanoPreview => Self::cardano_preview(),
            NetworkType::ErgoMainnet => Self::ergo_mainnet(),
        }
    }

    /// Resolve a persisted network id
    pub fn from_id(id: i64) -> Result<Self> {
        [
            NetworkType::CardanoMainnet,
            NetworkType::CardanoPreprod,
            NetworkType::CardanoPreview,
            NetworkType::ErgoMainnet,
        ]
        .into_iter()
        .map(Self::from_type)
        .find(|net| net.id == id)
        .ok_or(Error::UnknownNetworkId(id))
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cardano-mainnet" | "mainnet" => Ok(Self::CardanoMainnet),
            "cardano-preprod" | "preprod" => Ok(Self::CardanoPreprod),
            "cardano-preview" | "preview" => Ok(Self::CardanoPreview),
            "ergo-mainnet" | "ergo" => Ok(Self::ErgoMainnet),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardano_mainnet_params() {
        let net = Network::cardano_mainnet();
        assert_eq!(net.network_type, NetworkType::CardanoMainnet);
        assert_eq!(net.address_network_tag, 1);
        assert!(net.protocol.has_accounting());
    }

    #[test]
    fn test_network_from_id() {
        let net = Network::from_id(200).unwrap();
        assert_eq!(net.network_type, NetworkType::ErgoMainnet);
        assert!(!net.protocol.has_accounting());
        assert!(Network::from_id(7).is_err());
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("preprod".parse::<NetworkType>().unwrap(), NetworkType::CardanoPreprod);
        assert!("dogecoin".parse::<NetworkType>().is_err());
    }

    #[test]
    fn test_network_type_serde() {
        let json = serde_json::to_string(&NetworkType::ErgoMainnet).unwrap();
        let back: NetworkType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NetworkType::ErgoMainnet);
    }
}
