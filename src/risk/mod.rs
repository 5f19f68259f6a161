//! Risk routines that trim exposure.
//!
//! - Normal reduction: small randomized slices while the pool trades away
//!   from the index price
//! - Emergency reduction: both venues at once when a margin threshold is
//!   breached
//! - The shared risk mode that lets emergency handling silence the
//!   discretionary routines

mod emergency;
mod mode;
mod reducer;

pub use emergency::{EmergencyReducer, EmergencySettings};
pub use mode::{EmergencyGuard, RiskMode, RiskState};
pub use reducer::{in_trigger_band, spread, ReduceOutcome, Reducer};
