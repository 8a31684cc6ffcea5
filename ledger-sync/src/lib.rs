//! Remote history sync for the ledger store
//!
//! Pulls transaction history from a remote indexer and folds it into the
//! SQLite ledger: batch merge, reorg rollback, asset metadata resolution,
//! certificate normalization and UTXO snapshot maintenance.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod background;
pub mod cancel;
pub mod certificates;
pub mod client;
pub mod error;
pub mod fixture;
pub mod merge;
pub mod remote;
pub mod rollback;
pub mod snapshot;
pub mod sync;
pub mod token_resolver;

pub use background::{BackgroundSync, BackgroundSyncConfig, BackgroundSyncResult};
pub use cancel::CancelToken;
pub use certificates::CertificateNormalizer;
pub use client::{
    with_retry, HistoryAnchor, HistoryRequest, RemoteNetwork, RetryConfig, TxPointer,
};
pub use error::{Error, Result};
pub use fixture::{ChainFixture, FixtureRemote};
pub use merge::{merge_batch, merge_locks, MergeContext, MergeOutcome};
pub use remote::{
    BestBlock, PoolParams, RemoteAsset, RemoteBlock, RemoteCertificate, RemoteInput,
    RemoteOutput, RemoteTransaction, RemoteTxState, RemoteWithdrawal, TokenInfo,
};
pub use rollback::{rollback_locks, RollbackCoordinator, RollbackOutcome};
pub use snapshot::{reconcile, SnapshotManager, SnapshotReport};
pub use sync::{SyncConfig, SyncEngine, SyncReport};
pub use token_resolver::{ResolvedTokens, TokenResolver};
