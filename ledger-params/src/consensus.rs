//! Consensus parameters used by the sync engine

use crate::network::{Network, NetworkType};

/// Token metadata is considered fresh for one hour.
pub const DEFAULT_TOKEN_METADATA_TTL_SECS: i64 = 60 * 60;

/// Consensus parameters
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    /// Network configuration
    pub network: Network,
    /// Target block time in seconds
    pub block_time_target: u32,
    /// Blocks behind the tip after which a block is treated as final
    pub stable_depth: u64,
    /// Most-recent transactions fetched when a wallet has no confirmed anchor
    pub history_window_cap: u32,
    /// Seconds before cached token metadata is refetched
    pub token_metadata_ttl_secs: i64,
}

impl ConsensusParams {
    /// Create consensus params for Cardano mainnet
    pub fn cardano_mainnet() -> Self {
        Self {
            network: Network::cardano_mainnet(),
            block_time_target: 20,
            stable_depth: 2160, // security parameter k
            history_window_cap: 50,
            token_metadata_ttl_secs: DEFAULT_TOKEN_METADATA_TTL_SECS,
        }
    }

    /// Create consensus params for Cardano preprod
    pub fn cardano_preprod() -> Self {
        Self {
            network: Network::cardano_preprod(),
            ..Self::cardano_mainnet()
        }
    }

    /// Create consensus params for Cardano preview
    pub fn cardano_preview() -> Self {
        Self {
            network: Network::cardano_preview(),
            stable_depth: 432,
            ..Self::cardano_mainnet()
        }
    }

    /// Create consensus params for Ergo mainnet
    pub fn ergo_mainnet() -> Self {
        Self {
            network: Network::ergo_mainnet(),
            block_time_target: 120,
            stable_depth: 720,
            history_window_cap: 50,
            token_metadata_ttl_secs: DEFAULT_TOKEN_METADATA_TTL_SECS,
        }
    }

    /// Get consensus params by network type
    pub fn from_network(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::CardanoMainnet => Self::cardano_mainnet(),
            NetworkType::CardanoPreprod => Self::cardano_preprod(),
            NetworkType::CardanoPreview => Self::cardano_preview(),
            NetworkType::ErgoMainnet => Self::ergo_mainnet(),
        }
    }

    /// Lowest height still inside the unstable window below `best_height`.
    ///
    /// Everything at or above this height may still be reorganised away.
    pub fn unstable_from(&self, best_height: u64) -> u64 {
        best_height.saturating_sub(self.stable_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardano_consensus() {
        let params = ConsensusParams::cardano_mainnet();
        assert_eq!(params.stable_depth, 2160);
        assert_eq!(params.token_metadata_ttl_secs, 3600);
    }

    #[test]
    fn test_unstable_from() {
        let mut params = ConsensusParams::ergo_mainnet();
        params.stable_depth = 10;
        assert_eq!(params.unstable_from(500), 490);
        assert_eq!(params.unstable_from(4), 0);
    }

    #[test]
    fn test_from_network() {
        let params = ConsensusParams::from_network(NetworkType::CardanoPreprod);
        assert_eq!(params.network.id, 250);
        assert_eq!(params.stable_depth, 2160);
    }
}
