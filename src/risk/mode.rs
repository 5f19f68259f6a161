//! Engine-wide risk mode.

use std::fmt;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RiskMode {
    #[default]
    Normal,
    /// Margin breached; discretionary routines stand down
    Emergency,
}

impl fmt::Display for RiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskMode::Normal => write!(f, "normal"),
            RiskMode::Emergency => write!(f, "emergency"),
        }
    }
}

/// Shared risk mode, owned by the engine.
#[derive(Debug, Default)]
pub struct RiskState {
    mode: Mutex<RiskMode>,
}

impl RiskState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> RiskMode {
        *self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_emergency(&self) -> bool {
        self.mode() == RiskMode::Emergency
    }

    /// Switch to emergency mode until the returned guard is dropped.
    ///
    /// Returns `None` when emergency mode is already active.
    pub fn enter_emergency(&self) -> Option<EmergencyGuard<'_>> {
        let mut mode = self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *mode == RiskMode::Emergency {
            return None;
        }
        *mode = RiskMode::Emergency;
        info!(mode = %RiskMode::Emergency, "Risk mode changed");
        Some(EmergencyGuard { state: self })
    }
}

/// Restores normal mode on drop.
pub struct EmergencyGuard<'a> {
    state: &'a RiskState,
}

impl Drop for EmergencyGuard<'_> {
    fn drop(&mut self) {
        *self.state.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = RiskMode::Normal;
        info!(mode = %RiskMode::Normal, "Risk mode changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_scopes_emergency_mode() {
        let risk = RiskState::new();
        assert_eq!(risk.mode(), RiskMode::Normal);

        {
            let _guard = risk.enter_emergency().unwrap();
            assert!(risk.is_emergency());
            assert!(risk.enter_emergency().is_none());
        }

        assert_eq!(risk.mode(), RiskMode::Normal);
    }
}
