//! Remote indexer contract and retry policy
//!
//! The wallet never talks to a node directly; everything it learns about
//! the chain comes through [`RemoteNetwork`]. Implementations are expected
//! to be cheap to share (`Arc`) and safe to call concurrently.

use crate::remote::{BestBlock, RemoteTransaction, TokenInfo};
use crate::{Error, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Position in the chain's transaction order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPointer {
    /// Block containing the transaction
    pub block_hash: String,
    /// Transaction hash; `None` points at the end of the block
    pub tx_hash: Option<String>,
}

/// Window boundary of a history request.
///
/// `After` and `Before` are exclusive of the pointed transaction and of
/// each other: a request carries at most one boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAnchor {
    /// Oldest `limit` transactions strictly after the pointer
    After(TxPointer),
    /// Newest `limit` transactions strictly before the pointer
    Before(TxPointer),
}

/// History request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    /// Addresses whose transactions are wanted
    pub addresses: Vec<String>,
    /// Window boundary; `None` asks for the newest `limit` transactions
    pub anchor: Option<HistoryAnchor>,
    /// Confirmed transactions above this block are left out
    pub until_block: String,
    /// Page size
    pub limit: usize,
}

/// Remote indexer.
///
/// History pages are ordered by (height, ordinal) ascending with
/// unconfirmed transactions last. A history request whose anchor block is
/// not on the remote's best chain fails with [`Error::RollbackRequired`].
#[async_trait]
pub trait RemoteNetwork: Send + Sync {
    /// Transactions touching `request.addresses` inside the window
    async fn fetch_history(&self, request: &HistoryRequest) -> Result<Vec<RemoteTransaction>>;

    /// Current tip of `network_id`
    async fn fetch_best_block(&self, network_id: i64) -> Result<BestBlock>;

    /// Display metadata for `ids`; unknown ids are absent from the result
    async fn fetch_token_info(
        &self,
        network_id: i64,
        ids: &[String],
    ) -> Result<HashMap<String, TokenInfo>>;

    /// Mint events (with their attached metadata) for `ids`
    async fn fetch_mint_metadata(
        &self,
        network_id: i64,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<serde_json::Value>>>;

    /// Circulating supply for `ids`
    async fn fetch_supply(&self, network_id: i64, ids: &[String]) -> Result<HashMap<String, String>>;

    /// Subset of `addresses` that appear on chain
    async fn check_addresses_in_use(&self, addresses: &[String]) -> Result<HashSet<String>>;
}

/// Retry configuration for remote calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff following `current`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        std::cmp::min(
            Duration::from_millis((current.as_millis() as f64 * self.backoff_multiplier) as u64),
            self.max_backoff,
        )
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or
/// exhausts `config.max_attempts`
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, what: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt >= config.max_attempts {
                    warn!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }
                debug!(
                    "{} attempt {} failed, retrying in {:?}: {}",
                    what, attempt, backoff, e
                );
                tokio::time::sleep(jitter_duration(backoff)).await;
                backoff = config.next_backoff(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn jitter_duration(duration: Duration) -> Duration {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let jittered = (millis as f64 * jitter) as u64;
    Duration::from_millis(jittered.max(1))
}

/// Reject a request that could not be served as a single window
pub(crate) fn check_request(request: &HistoryRequest) -> Result<()> {
    if request.limit == 0 {
        return Err(Error::Validation("history request with zero limit".into()));
    }
    if request.until_block.is_empty() {
        return Err(Error::Validation("history request without until block".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = fast();
        let mut backoff = config.initial_backoff;
        for _ in 0..10 {
            backoff = config.next_backoff(backoff);
        }
        assert_eq!(backoff, config.max_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_network_errors() {
        let calls = AtomicU32::new(0);
        let value = with_retry(&fast(), "echo", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Network("timeout".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "echo", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Network("down".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rollback_signal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(), "history", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::RollbackRequired("unknown block".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::RollbackRequired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_check_request() {
        let mut request = HistoryRequest {
            addresses: vec!["a".into()],
            anchor: None,
            until_block: "tip".into(),
            limit: 10,
        };
        assert!(check_request(&request).is_ok());
        request.limit = 0;
        assert!(check_request(&request).is_err());
    }
}
