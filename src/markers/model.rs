//! Instruction set: structured placement directives decoded from generator output.

use serde::{Deserialize, Serialize};

/// A block to splice in after the Nth paragraph of the primary text.
///
/// Position 0 means "before the first paragraph".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insert {
    pub position: usize,
    pub content: String,
}

impl Insert {
    pub fn new(position: usize, content: impl Into<String>) -> Self {
        Self {
            position,
            content: content.into(),
        }
    }
}

/// Placement instructions for secondary content.
///
/// Every block is non-empty after trimming. `inserts` is kept sorted by
/// position, highest first, so splicing in order never shifts an index a
/// later insert still refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionSet {
    #[serde(default)]
    pub prepend: Vec<String>,
    #[serde(default)]
    pub append: Vec<String>,
    #[serde(default)]
    pub inserts: Vec<Insert>,
}

impl InstructionSet {
    /// True when at least one block survived parsing.
    pub fn has_content(&self) -> bool {
        !self.prepend.is_empty() || !self.append.is_empty() || !self.inserts.is_empty()
    }

    /// Total number of blocks across all kinds.
    pub fn block_count(&self) -> usize {
        self.prepend.len() + self.append.len() + self.inserts.len()
    }

    /// Restore descending position order (stable for equal positions).
    pub(crate) fn sort_inserts(&mut self) {
        self.inserts.sort_by(|a, b| b.position.cmp(&a.position));
    }
}
