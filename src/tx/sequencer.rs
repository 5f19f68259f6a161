//! Nonce-safe transaction submission.
//!
//! Each address owns a [`NonceState`] behind an async mutex. A submission
//! holds the lock from the first attempt until the transaction is accepted
//! (or abandoned), so at most one transaction per address is in flight.
//! Nonce conflicts are recovered locally by re-reading the authoritative
//! count from the chain and retrying under a bounded [`RetryPolicy`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::error::{SequencerError, TxError};
use crate::config::MakerConfig;
use crate::exchange::PendingTx;

/// Authoritative source of an account's next nonce.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceSource: Send + Sync {
    /// Number of transactions sent from `address`, including pending ones.
    async fn transaction_count(&self, address: &str) -> anyhow::Result<u64>;
}

/// How nonce conflicts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Pause between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &MakerConfig) -> Self {
        Self {
            max_retries: config.max_retry_count,
            backoff: config.nonce_retry_backoff(),
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Next nonce for one address.
#[derive(Debug)]
pub struct NonceState {
    next_nonce: u64,
}

impl NonceState {
    pub fn next_nonce(&self) -> u64 {
        self.next_nonce
    }
}

/// Serializes submissions per address and recovers from nonce conflicts.
pub struct TxSequencer {
    nonce_source: Arc<dyn NonceSource>,
    policy: RetryPolicy,
    states: RwLock<HashMap<String, Arc<Mutex<NonceState>>>>,
}

impl TxSequencer {
    pub fn new(nonce_source: Arc<dyn NonceSource>, policy: RetryPolicy) -> Self {
        Self {
            nonce_source,
            policy,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Create the nonce state for `address` from the chain's count.
    ///
    /// Returns the next nonce. Registering an address twice keeps the
    /// existing state.
    pub async fn register(&self, address: &str) -> Result<u64, SequencerError> {
        let state = self.state_for(address).await?;
        let next_nonce = state.lock().await.next_nonce;
        info!(%address, next_nonce, "Registered nonce state");
        Ok(next_nonce)
    }

    /// Next nonce that will be used for `address`, if registered.
    pub async fn next_nonce(&self, address: &str) -> Option<u64> {
        let state = self.states.read().await.get(address).cloned()?;
        let next_nonce = state.lock().await.next_nonce;
        Some(next_nonce)
    }

    async fn fetch_nonce(&self, address: &str) -> Result<u64, SequencerError> {
        self.nonce_source
            .transaction_count(address)
            .await
            .map_err(|source| SequencerError::NonceSync {
                address: address.to_string(),
                source,
            })
    }

    async fn state_for(&self, address: &str) -> Result<Arc<Mutex<NonceState>>, SequencerError> {
        if let Some(state) = self.states.read().await.get(address) {
            return Ok(state.clone());
        }

        let next_nonce = self.fetch_nonce(address).await?;
        let mut states = self.states.write().await;
        let state = states
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NonceState { next_nonce })));
        Ok(state.clone())
    }

    /// Submit a transaction built by `build` with the address's next nonce.
    ///
    /// `build` may be called several times with different nonces; it must
    /// send exactly one transaction per call. The returned handle is only
    /// accepted by the node; callers await confirmation separately.
    pub async fn submit<F, Fut>(
        &self,
        address: &str,
        mut build: F,
    ) -> Result<PendingTx, SequencerError>
    where
        F: FnMut(u64) -> Fut + Send,
        Fut: Future<Output = Result<PendingTx, TxError>> + Send,
    {
        let state = self.state_for(address).await?;
        let mut state = state.lock().await;

        for attempt in 0..self.policy.max_attempts() {
            if attempt > 0 {
                info!(%address, retry_count = attempt, "Retrying transaction submission");
            }

            let nonce = state.next_nonce;
            debug!(%address, nonce, attempt, "Submitting transaction");

            match build(nonce).await {
                Ok(tx) => {
                    state.next_nonce += 1;
                    info!(
                        %address,
                        tx_hash = %tx.hash,
                        nonce = tx.nonce,
                        gas_limit = tx.gas_limit,
                        max_fee_per_gas = ?tx.max_fee_per_gas,
                        max_priority_fee_per_gas = ?tx.max_priority_fee_per_gas,
                        "Transaction sent"
                    );
                    return Ok(tx);
                }
                Err(e) if e.is_nonce_conflict() => {
                    let expired_nonce = state.next_nonce;
                    state.next_nonce = self.fetch_nonce(address).await?;
                    warn!(
                        %address,
                        expired_nonce,
                        new_nonce = state.next_nonce,
                        error = %e,
                        "Nonce reset after conflict"
                    );
                    if attempt + 1 < self.policy.max_attempts() && !self.policy.backoff.is_zero() {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
                Err(e) => {
                    warn!(%address, nonce, error = %e, "Transaction submission failed");
                    return Err(e.into());
                }
            }
        }

        error!(
            %address,
            attempts = self.policy.max_attempts(),
            "Giving up after repeated nonce conflicts"
        );
        Err(SequencerError::RetryBudgetExhausted {
            address: address.to_string(),
            attempts: self.policy.max_attempts(),
        })
    }
}
