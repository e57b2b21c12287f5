//! Host transcript interface.
//!
//! The transcript owns message records, including each message's
//! [`AugmentationState`]. The controller reads messages, commits state and
//! asks the host to re-render through this trait.

pub mod memory;

pub use memory::MemoryTranscript;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TranscriptError;
use crate::markers::{self, InstructionSet};

/// Index of a message in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub usize);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-message augmentation state, persisted on the message record.
///
/// `primary_original`, `raw_output` and `instructions` are committed
/// together; afterwards only `primary_original` changes (on edit).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationState {
    /// Primary text the instructions were last merged against.
    pub primary_original: Option<String>,
    /// Last raw generator output, verbatim.
    pub raw_output: Option<String>,
    pub instructions: Option<InstructionSet>,
    /// A generation attempt has been made for this message.
    pub processed: bool,
}

impl AugmentationState {
    /// Whether there is anything to re-merge on edit.
    pub fn can_reconcile(&self) -> bool {
        self.primary_original.is_some() && self.instructions.is_some()
    }

    /// Rendered text as of the last merge, if state is complete.
    pub fn rendered(&self) -> Option<String> {
        let primary = self.primary_original.as_deref()?;
        let instructions = self.instructions.as_ref()?;
        Some(markers::merge(primary, Some(instructions)))
    }
}

/// State written after a successful generation + parse.
#[derive(Debug, Clone)]
pub struct AugmentationCommit {
    pub primary_original: String,
    pub raw_output: String,
    pub instructions: InstructionSet,
}

/// A message as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub id: MessageId,
    pub is_user: bool,
    /// Current text of the message (rendered text once merged).
    pub text: String,
    pub augmentation: AugmentationState,
}

impl TranscriptMessage {
    /// Text to hand to the generator: the stored primary text when present.
    pub fn primary_text(&self) -> &str {
        self.augmentation
            .primary_original
            .as_deref()
            .unwrap_or(&self.text)
    }
}

/// A previous generator exchange, shown to the generator for consistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub main: String,
    pub raw_output: String,
}

/// Events raised by the host transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TranscriptEvent {
    /// A message arrived. `None` means the last message.
    Received { id: Option<MessageId> },
    /// The user asked to regenerate secondary content for a message.
    Regenerate { id: MessageId },
    /// Regenerate for the last message.
    RegenerateLast,
    /// A message's text changed.
    Edited { id: MessageId },
}

/// Backend-agnostic transcript store.
#[async_trait]
pub trait Transcript: Send + Sync {
    /// Look up a message.
    async fn message(&self, id: MessageId) -> Option<TranscriptMessage>;

    /// Id of the newest message.
    async fn last_id(&self) -> Option<MessageId>;

    /// Active character, used for per-character settings.
    async fn character_id(&self) -> Option<String>;

    /// Set `processed` without touching other state.
    async fn mark_processed(&self, id: MessageId) -> Result<(), TranscriptError>;

    /// Commit generated state atomically and set `processed`.
    async fn commit_augmentation(
        &self,
        id: MessageId,
        commit: AugmentationCommit,
    ) -> Result<(), TranscriptError>;

    /// Replace `primary_original` after an edit.
    async fn set_primary_original(&self, id: MessageId, text: &str) -> Result<(), TranscriptError>;

    /// Re-render a message with new display text. Fire-and-forget.
    fn render(&self, id: MessageId, text: &str);

    /// Up to `turns` earlier non-user messages carrying generator output,
    /// oldest first.
    async fn recent_outputs(&self, before: MessageId, turns: usize) -> Vec<HistoryTurn> {
        let mut history = Vec::new();
        let mut cursor = before.0;
        while cursor > 0 && history.len() < turns {
            cursor -= 1;
            let Some(message) = self.message(MessageId(cursor)).await else {
                continue;
            };
            if message.is_user {
                continue;
            }
            if let Some(raw) = &message.augmentation.raw_output {
                history.push(HistoryTurn {
                    main: message.primary_text().to_string(),
                    raw_output: raw.clone(),
                });
            }
        }
        history.reverse();
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_requires_complete_state() {
        let mut state = AugmentationState::default();
        assert!(state.rendered().is_none());
        assert!(!state.can_reconcile());

        state.primary_original = Some("A\n\nB".into());
        state.instructions = Some(InstructionSet {
            append: vec!["X".into()],
            ..Default::default()
        });
        assert!(state.can_reconcile());
        assert_eq!(state.rendered().unwrap(), "A\n\nB\n\nX");
    }

    #[test]
    fn primary_text_prefers_stored_original() {
        let mut message = TranscriptMessage {
            id: MessageId(0),
            is_user: false,
            text: "rendered".into(),
            augmentation: AugmentationState::default(),
        };
        assert_eq!(message.primary_text(), "rendered");
        message.augmentation.primary_original = Some("original".into());
        assert_eq!(message.primary_text(), "original");
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let event: TranscriptEvent = serde_json::from_str(r#"{"event":"edited","id":4}"#).unwrap();
        assert_eq!(event, TranscriptEvent::Edited { id: MessageId(4) });

        let event: TranscriptEvent = serde_json::from_str(r#"{"event":"received","id":null}"#).unwrap();
        assert_eq!(event, TranscriptEvent::Received { id: None });
    }
}
