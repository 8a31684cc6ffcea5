//! Network parameters and constants for the wallet ledger mirror
//!
//! This crate provides the supported networks, the chain protocol each one
//! speaks, and the consensus values the sync engine relies on (stable
//! confirmation depth, history window cap, token metadata freshness).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consensus;
pub mod network;

pub use consensus::ConsensusParams;
pub use network::{ChainProtocol, Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Unknown numeric network id
    #[error("Unknown network id: {0}")]
    UnknownNetworkId(i64),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
