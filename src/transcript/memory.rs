//! In-memory transcript with optional JSON file persistence.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    AugmentationCommit, AugmentationState, MessageId, Transcript, TranscriptEvent,
    TranscriptMessage,
};
use crate::error::TranscriptError;

/// A message record as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_user: bool,
    pub text: String,
    #[serde(default)]
    pub extra: AugmentationState,
}

impl StoredMessage {
    pub fn new(is_user: bool, text: impl Into<String>) -> Self {
        Self {
            name: None,
            is_user,
            text: text.into(),
            extra: AugmentationState::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TranscriptFile {
    #[serde(default)]
    character_id: Option<String>,
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

/// In-memory transcript.
///
/// When a change notifier is attached, every [`Transcript::render`] emits an
/// [`TranscriptEvent::Edited`] for the rendered message, the way a host UI
/// reports its own re-render as a change.
pub struct MemoryTranscript {
    inner: RwLock<TranscriptFile>,
    notifier: Option<mpsc::UnboundedSender<TranscriptEvent>>,
    renders: AtomicUsize,
}

impl MemoryTranscript {
    /// Empty transcript.
    pub fn new(character_id: Option<String>) -> Self {
        Self::from_file(TranscriptFile {
            character_id,
            messages: Vec::new(),
        })
    }

    fn from_file(file: TranscriptFile) -> Self {
        Self {
            inner: RwLock::new(file),
            notifier: None,
            renders: AtomicUsize::new(0),
        }
    }

    /// Load a transcript from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TranscriptError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let file: TranscriptFile = serde_json::from_str(&raw)?;
        Ok(Self::from_file(file))
    }

    /// Write the transcript to a JSON file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), TranscriptError> {
        let json = serde_json::to_string_pretty(&*self.read())?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Report every render as an edit notification on `tx`.
    pub fn with_change_notifier(mut self, tx: mpsc::UnboundedSender<TranscriptEvent>) -> Self {
        self.notifier = Some(tx);
        self
    }

    /// Append a message and return its id.
    pub fn push_message(&self, is_user: bool, text: impl Into<String>) -> MessageId {
        let mut file = self.write();
        file.messages.push(StoredMessage::new(is_user, text));
        MessageId(file.messages.len() - 1)
    }

    /// Replace a message's text the way a user edit would.
    pub fn edit_text(&self, id: MessageId, text: impl Into<String>) -> Result<(), TranscriptError> {
        let mut file = self.write();
        let message = file
            .messages
            .get_mut(id.0)
            .ok_or(TranscriptError::MessageNotFound { id: id.0 })?;
        message.text = text.into();
        Ok(())
    }

    /// Current text of a message.
    pub fn text(&self, id: MessageId) -> Option<String> {
        self.read().messages.get(id.0).map(|m| m.text.clone())
    }

    /// Number of renders requested so far.
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, TranscriptFile> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TranscriptFile> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<F>(&self, id: MessageId, mutate: F) -> Result<(), TranscriptError>
    where
        F: FnOnce(&mut AugmentationState),
    {
        let mut file = self.write();
        let message = file
            .messages
            .get_mut(id.0)
            .ok_or(TranscriptError::MessageNotFound { id: id.0 })?;
        mutate(&mut message.extra);
        Ok(())
    }
}

#[async_trait]
impl Transcript for MemoryTranscript {
    async fn message(&self, id: MessageId) -> Option<TranscriptMessage> {
        self.read().messages.get(id.0).map(|m| TranscriptMessage {
            id,
            is_user: m.is_user,
            text: m.text.clone(),
            augmentation: m.extra.clone(),
        })
    }

    async fn last_id(&self) -> Option<MessageId> {
        self.read().messages.len().checked_sub(1).map(MessageId)
    }

    async fn character_id(&self) -> Option<String> {
        self.read().character_id.clone()
    }

    async fn mark_processed(&self, id: MessageId) -> Result<(), TranscriptError> {
        self.with_state(id, |state| state.processed = true)
    }

    async fn commit_augmentation(
        &self,
        id: MessageId,
        commit: AugmentationCommit,
    ) -> Result<(), TranscriptError> {
        self.with_state(id, |state| {
            state.primary_original = Some(commit.primary_original);
            state.raw_output = Some(commit.raw_output);
            state.instructions = Some(commit.instructions);
            state.processed = true;
        })
    }

    async fn set_primary_original(&self, id: MessageId, text: &str) -> Result<(), TranscriptError> {
        self.with_state(id, |state| state.primary_original = Some(text.to_string()))
    }

    fn render(&self, id: MessageId, text: &str) {
        {
            let mut file = self.write();
            let Some(message) = file.messages.get_mut(id.0) else {
                debug!(message_id = %id, "Render requested for missing message");
                return;
            };
            message.text = text.to_string();
        }
        self.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.notifier {
            // Closed receiver just means nobody is listening.
            let _ = tx.send(TranscriptEvent::Edited { id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::InstructionSet;

    #[tokio::test]
    async fn commit_sets_all_fields_together() {
        let transcript = MemoryTranscript::new(None);
        let id = transcript.push_message(false, "A\n\nB");
        transcript
            .commit_augmentation(
                id,
                AugmentationCommit {
                    primary_original: "A\n\nB".into(),
                    raw_output: "[APPEND]X[/APPEND]".into(),
                    instructions: InstructionSet {
                        append: vec!["X".into()],
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();

        let state = transcript.message(id).await.unwrap().augmentation;
        assert!(state.processed);
        assert_eq!(state.primary_original.as_deref(), Some("A\n\nB"));
        assert_eq!(state.raw_output.as_deref(), Some("[APPEND]X[/APPEND]"));
        assert_eq!(state.rendered().unwrap(), "A\n\nB\n\nX");
    }

    #[tokio::test]
    async fn missing_message_is_an_error() {
        let transcript = MemoryTranscript::new(None);
        assert!(matches!(
            transcript.mark_processed(MessageId(3)).await,
            Err(TranscriptError::MessageNotFound { id: 3 })
        ));
        assert!(transcript.last_id().await.is_none());
    }

    #[tokio::test]
    async fn render_updates_text_and_notifies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transcript = MemoryTranscript::new(None).with_change_notifier(tx);
        let id = transcript.push_message(false, "old");

        transcript.render(id, "new");
        assert_eq!(transcript.text(id).as_deref(), Some("new"));
        assert_eq!(transcript.render_count(), 1);
        assert_eq!(rx.recv().await, Some(TranscriptEvent::Edited { id }));

        transcript.render(MessageId(9), "ignored");
        assert_eq!(transcript.render_count(), 1);
    }

    #[tokio::test]
    async fn recent_outputs_skip_users_and_unprocessed() {
        let transcript = MemoryTranscript::new(None);
        for i in 0..6 {
            let id = transcript.push_message(i % 2 == 0, format!("msg {i}"));
            if i % 2 == 1 && i != 3 {
                transcript
                    .commit_augmentation(
                        id,
                        AugmentationCommit {
                            primary_original: format!("primary {i}"),
                            raw_output: format!("raw {i}"),
                            instructions: InstructionSet::default(),
                        },
                    )
                    .await
                    .unwrap();
            }
        }

        let history = transcript.recent_outputs(MessageId(6), 5).await;
        let mains: Vec<&str> = history.iter().map(|h| h.main.as_str()).collect();
        assert_eq!(mains, vec!["primary 1", "primary 5"]);

        let history = transcript.recent_outputs(MessageId(6), 1).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].raw_output, "raw 5");

        assert!(transcript.recent_outputs(MessageId(5), 3).await.iter().all(|h| h.main != "primary 5"));
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");

        let transcript = MemoryTranscript::new(Some("alice".into()));
        let id = transcript.push_message(false, "hello");
        transcript.mark_processed(id).await.unwrap();
        transcript.save(&path).await.unwrap();

        let loaded = MemoryTranscript::load(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.character_id().await.as_deref(), Some("alice"));
        assert!(loaded.message(id).await.unwrap().augmentation.processed);
    }
}
