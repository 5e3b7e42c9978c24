//! Order state machine.

use serde::{Deserialize, Serialize};

/// The state of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Draft ──► Submitted ──► Confirmed
///   │           │             │
///   └───────────┴─────────────┴──► Cancelled
/// ```
/// Deletion is tracked separately and is allowed from `Draft` and `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderState {
    /// Lines can be added, removed and changed.
    #[default]
    Draft,

    /// Waiting for stock to be reserved.
    Submitted,

    Confirmed,

    Cancelled,
}

impl OrderState {
    pub fn can_modify_lines(&self) -> bool {
        matches!(self, OrderState::Draft)
    }

    pub fn can_submit(&self) -> bool {
        matches!(self, OrderState::Draft)
    }

    pub fn can_confirm(&self) -> bool {
        matches!(self, OrderState::Submitted)
    }

    pub fn can_cancel(&self) -> bool {
        !matches!(self, OrderState::Cancelled)
    }

    pub fn can_delete(&self) -> bool {
        matches!(self, OrderState::Draft | OrderState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Draft => "Draft",
            OrderState::Submitted => "Submitted",
            OrderState::Confirmed => "Confirmed",
            OrderState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_drafts_change_lines() {
        assert!(OrderState::Draft.can_modify_lines());
        assert!(!OrderState::Submitted.can_modify_lines());
        assert!(!OrderState::Confirmed.can_modify_lines());
    }

    #[test]
    fn cancellation_is_final() {
        assert!(OrderState::Confirmed.can_cancel());
        assert!(!OrderState::Cancelled.can_cancel());
        assert!(OrderState::Cancelled.can_delete());
        assert!(!OrderState::Submitted.can_delete());
    }
}
