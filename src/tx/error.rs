//! Transaction submission errors.

use thiserror::Error;

const NONCE_EXPIRED_CODE: &str = "NONCE_EXPIRED";
const NONCE_CONFLICT_PATTERNS: [&str; 3] =
    ["invalid transaction nonce", "nonce too low", "nonce expired"];

/// Failure reported by a ledger while sending or confirming a transaction.
#[derive(Debug, Error)]
pub enum TxError {
    /// The nonce was already used or is otherwise stale.
    #[error("nonce conflict: {message}")]
    NonceConflict { message: String },

    /// The node refused the transaction for any other reason.
    #[error("transaction rejected ({code:?}): {message}")]
    Rejected { code: Option<String>, message: String },

    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("transaction {tx_hash} not mined in time")]
    ConfirmTimeout { tx_hash: String },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl TxError {
    /// Classify a node error by its code and message.
    pub fn classify(code: Option<&str>, message: &str) -> Self {
        let lowered = message.to_lowercase();
        if code == Some(NONCE_EXPIRED_CODE)
            || NONCE_CONFLICT_PATTERNS.iter().any(|p| lowered.contains(p))
        {
            TxError::NonceConflict {
                message: message.to_string(),
            }
        } else {
            TxError::Rejected {
                code: code.map(str::to_string),
                message: message.to_string(),
            }
        }
    }

    pub fn is_nonce_conflict(&self) -> bool {
        matches!(self, TxError::NonceConflict { .. })
    }
}

/// Failure of a sequenced submission.
#[derive(Debug, Error)]
pub enum SequencerError {
    #[error(transparent)]
    Tx(#[from] TxError),

    /// Every attempt hit a nonce conflict.
    #[error("retry budget exhausted for {address} after {attempts} attempts")]
    RetryBudgetExhausted { address: String, attempts: u32 },

    /// The authoritative nonce could not be read.
    #[error("failed to sync nonce for {address}: {source}")]
    NonceSync {
        address: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_nonce_conflicts() {
        assert!(TxError::classify(Some("NONCE_EXPIRED"), "whatever").is_nonce_conflict());
        assert!(TxError::classify(None, "Invalid transaction nonce").is_nonce_conflict());
        assert!(TxError::classify(Some("-32000"), "nonce too low").is_nonce_conflict());
    }

    #[test]
    fn test_classify_other_rejections() {
        let err = TxError::classify(Some("-32000"), "insufficient funds for gas");
        assert!(!err.is_nonce_conflict());
        assert!(err.to_string().contains("insufficient funds"));
    }
}
