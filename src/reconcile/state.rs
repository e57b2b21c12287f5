//! Per-message augmentation phase.

use serde::{Deserialize, Serialize};

use crate::transcript::AugmentationState;

/// Where a message is in the augmentation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePhase {
    /// No generation attempted yet.
    Untouched,
    /// A generation cycle is in flight.
    Generating,
    /// Secondary content is stored and rendered.
    Merged,
    /// Stored instructions are being re-applied after an edit.
    Remerging,
    /// An attempt was made but nothing was merged.
    Processed,
}

impl MessagePhase {
    /// Settled phase implied by persisted state.
    pub fn from_state(state: &AugmentationState) -> Self {
        if state.can_reconcile() {
            Self::Merged
        } else if state.processed {
            Self::Processed
        } else {
            Self::Untouched
        }
    }

    pub fn can_transition_to(&self, target: MessagePhase) -> bool {
        use MessagePhase::*;

        matches!(
            (self, target),
            (Untouched, Generating) |
            // Manual regeneration
            (Merged, Generating) | (Processed, Generating) |
            (Generating, Merged) | (Generating, Processed) |
            (Merged, Remerging) | (Remerging, Merged)
        )
    }

    /// A cycle is running for this message.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Generating | Self::Remerging)
    }
}

impl std::fmt::Display for MessagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Untouched => "untouched",
            Self::Generating => "generating",
            Self::Merged => "merged",
            Self::Remerging => "remerging",
            Self::Processed => "processed",
        };
        write!(f, "{s}")
    }
}
