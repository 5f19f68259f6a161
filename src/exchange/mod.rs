//! Exchange integrations for the maker.
//!
//! ## Perpetual protocol
//! The [`Ledger`] trait covers contract reads and transaction submission.
//! [`MockLedger`] simulates the protocol for paper trading and tests.
//!
//! ## Hedge venue
//! Signed REST client for the secondary venue used to offset exposure, plus
//! an in-memory simulator.

mod hedge_client;
pub mod mock;
mod traits;
mod types;

pub use hedge_client::HedgeVenueClient;
pub use mock::{MockHedgeVenue, MockLedger};
pub use traits::{HedgeVenue, Ledger};
pub use types::*;
