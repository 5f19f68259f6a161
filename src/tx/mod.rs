//! Transaction submission.
//!
//! - `sequencer`: per-address nonce management with conflict retry
//! - `operations`: contract call wrappers that submit and await receipts
//! - `error`: submission error kinds

pub mod error;
pub mod operations;
pub mod sequencer;

pub use error::{SequencerError, TxError};
pub use operations::{TxOperations, DEFAULT_REFERRAL_CODE};
pub use sequencer::{NonceSource, NonceState, RetryPolicy, TxSequencer};
