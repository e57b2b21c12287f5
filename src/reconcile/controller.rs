//! Reconciliation controller.
//!
//! Ties the generator, the marker protocol and the transcript together:
//!
//! - **Arrival**: generate for a new non-user message once, merge, render
//! - **Manual regeneration**: re-run generation against the stored primary text
//! - **Edit**: re-apply stored instructions to the edited primary text
//!
//! Handlers never return errors. Failures are logged, surfaced as notices
//! and reported through [`Outcome`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::gate::{GenerationGate, SuppressionWindow};
use super::notice::{Notice, NoticeBus};
use super::state::MessagePhase;
use crate::config::SettingsManager;
use crate::error::{ConfigError, GeneratorError};
use crate::generator::{GenerationInput, SecondaryGenerator};
use crate::markers;
use crate::transcript::{
    AugmentationCommit, MessageId, Transcript, TranscriptEvent, TranscriptMessage,
};

/// Why a handler did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// Another cycle holds the gate.
    Busy,
    /// Edit arrived inside the post-render window.
    Suppressed,
    NotFound,
    UserMessage,
    AlreadyProcessed,
    /// Edit on a message with no stored instructions.
    NothingStored,
    /// The generator has no usable connection profile.
    NotConfigured,
}

/// Result of handling one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Generated content was merged and rendered.
    Merged { rendered: String },
    /// Stored content was re-applied after an edit.
    Remerged { rendered: String },
    /// Edited text already matched the rendered text.
    Unchanged,
    /// Generation produced nothing usable.
    NoContent,
    Skipped(SkipReason),
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Arrival,
    Manual,
}

impl Trigger {
    fn started_notice(self) -> &'static str {
        match self {
            Self::Arrival => "Generating with auxiliary model...",
            Self::Manual => "Regenerating auxiliary response...",
        }
    }

    fn merged_notice(self) -> &'static str {
        match self {
            Self::Arrival => "Auxiliary content merged",
            Self::Manual => "Auxiliary response regenerated",
        }
    }

    fn empty_notice(self) -> &'static str {
        match self {
            Self::Arrival => "No auxiliary content to merge",
            Self::Manual => "No auxiliary content generated",
        }
    }
}

/// Drives generation and edit reconciliation for one transcript.
pub struct Controller {
    settings: Arc<SettingsManager>,
    transcript: Arc<dyn Transcript>,
    generator: Arc<dyn SecondaryGenerator>,
    gate: GenerationGate,
    suppression: SuppressionWindow,
    notices: NoticeBus,
    /// In-flight phases only; settled phases are derived from the transcript.
    phases: Mutex<HashMap<MessageId, MessagePhase>>,
}

impl Controller {
    pub fn new(
        settings: Arc<SettingsManager>,
        transcript: Arc<dyn Transcript>,
        generator: Arc<dyn SecondaryGenerator>,
    ) -> Self {
        Self {
            settings,
            transcript,
            generator,
            gate: GenerationGate::new(),
            suppression: SuppressionWindow::new(),
            notices: NoticeBus::new(),
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Whether a generation cycle is in flight.
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Current phase of a message, `None` if it does not exist.
    pub async fn phase(&self, id: MessageId) -> Option<MessagePhase> {
        if let Some(phase) = self.in_flight_phase(id) {
            return Some(phase);
        }
        self.transcript
            .message(id)
            .await
            .map(|m| MessagePhase::from_state(&m.augmentation))
    }

    /// Dispatch a transcript event.
    pub async fn handle(&self, event: TranscriptEvent) -> Outcome {
        match event {
            TranscriptEvent::Received { id } => self.on_message_received(id).await,
            TranscriptEvent::Regenerate { id } => self.regenerate(id).await,
            TranscriptEvent::RegenerateLast => self.regenerate_last().await,
            TranscriptEvent::Edited { id } => self.on_message_edited(id).await,
        }
    }

    /// A message arrived; `None` means the last message.
    pub async fn on_message_received(&self, id: Option<MessageId>) -> Outcome {
        if !self.settings.is_enabled().await {
            debug!("Auxiliary generation disabled, ignoring arrival");
            return Outcome::Skipped(SkipReason::Disabled);
        }
        let id = match id {
            Some(id) => id,
            None => match self.transcript.last_id().await {
                Some(id) => id,
                None => return Outcome::Skipped(SkipReason::NotFound),
            },
        };

        let Some(_guard) = self.gate.try_acquire(id) else {
            info!(
                message_id = %id,
                holder = ?self.gate.holder(),
                "Generation in flight, dropping arrival"
            );
            return Outcome::Skipped(SkipReason::Busy);
        };

        let Some(message) = self.transcript.message(id).await else {
            return Outcome::Skipped(SkipReason::NotFound);
        };
        if message.is_user {
            return Outcome::Skipped(SkipReason::UserMessage);
        }
        if message.augmentation.processed {
            debug!(message_id = %id, "Message already processed");
            return Outcome::Skipped(SkipReason::AlreadyProcessed);
        }
        if let Err(outcome) = self.preflight(id).await {
            return outcome;
        }

        // Set before the generator call so duplicate events see it.
        if let Err(e) = self.transcript.mark_processed(id).await {
            return self.fail(id, &e.to_string());
        }

        let primary = message.text.clone();
        self.run_cycle(&message, primary, Trigger::Arrival).await
    }

    /// Regenerate secondary content for `id` on user request.
    pub async fn regenerate(&self, id: MessageId) -> Outcome {
        if !self.settings.is_enabled().await {
            self.notices.warning("Auxiliary generation is disabled");
            return Outcome::Skipped(SkipReason::Disabled);
        }

        let Some(_guard) = self.gate.try_acquire(id) else {
            self.notices.warning("Already processing");
            return Outcome::Skipped(SkipReason::Busy);
        };

        let message = match self.transcript.message(id).await {
            Some(m) if !m.is_user => m,
            other => {
                self.notices.warning("Invalid message");
                return Outcome::Skipped(match other {
                    Some(_) => SkipReason::UserMessage,
                    None => SkipReason::NotFound,
                });
            }
        };
        if let Err(outcome) = self.preflight(id).await {
            return outcome;
        }

        if let Err(e) = self.transcript.mark_processed(id).await {
            return self.fail(id, &e.to_string());
        }

        let primary = message.primary_text().to_string();
        self.run_cycle(&message, primary, Trigger::Manual).await
    }

    /// Regenerate for the newest message.
    pub async fn regenerate_last(&self) -> Outcome {
        match self.transcript.last_id().await {
            Some(id) => self.regenerate(id).await,
            None => {
                self.notices.warning("Invalid message");
                Outcome::Skipped(SkipReason::NotFound)
            }
        }
    }

    /// A message's text changed; re-apply stored instructions.
    pub async fn on_message_edited(&self, id: MessageId) -> Outcome {
        if self.gate.is_busy() {
            debug!(message_id = %id, "Generation in flight, ignoring edit");
            return Outcome::Skipped(SkipReason::Busy);
        }
        if self.suppression.is_open() {
            debug!(message_id = %id, "Edit inside suppression window, ignoring");
            return Outcome::Skipped(SkipReason::Suppressed);
        }

        let Some(message) = self.transcript.message(id).await else {
            return Outcome::Skipped(SkipReason::NotFound);
        };
        if message.is_user {
            return Outcome::Skipped(SkipReason::UserMessage);
        }
        let state = &message.augmentation;
        let (Some(original), Some(instructions)) = (&state.primary_original, &state.instructions)
        else {
            return Outcome::Skipped(SkipReason::NothingStored);
        };

        if message.text == markers::merge(original, Some(instructions)) {
            return Outcome::Unchanged;
        }

        self.transition(id, MessagePhase::Merged, MessagePhase::Remerging);
        let edited = message.text.as_str();
        if let Err(e) = self.transcript.set_primary_original(id, edited).await {
            self.transition(id, MessagePhase::Remerging, MessagePhase::Merged);
            return self.fail(id, &e.to_string());
        }

        let rendered = markers::merge(edited, Some(instructions));
        self.render(id, &rendered).await;
        self.transition(id, MessagePhase::Remerging, MessagePhase::Merged);

        info!(
            message_id = %id,
            edited_len = edited.len(),
            rendered_len = rendered.len(),
            "Re-merged auxiliary content after edit"
        );
        Outcome::Remerged { rendered }
    }

    async fn run_cycle(&self, message: &TranscriptMessage, primary: String, trigger: Trigger) -> Outcome {
        let id = message.id;
        self.transition(
            id,
            MessagePhase::from_state(&message.augmentation),
            MessagePhase::Generating,
        );
        self.notices.info(trigger.started_notice());

        let outcome = self.generate_and_merge(id, primary, trigger).await;

        let settled = match self.transcript.message(id).await {
            Some(m) => MessagePhase::from_state(&m.augmentation),
            None => MessagePhase::Processed,
        };
        self.transition(id, MessagePhase::Generating, settled);
        outcome
    }

    async fn generate_and_merge(&self, id: MessageId, primary: String, trigger: Trigger) -> Outcome {
        let history_turns = self.settings.snapshot().await.effective_history_turns();
        let input = GenerationInput {
            message_id: id,
            primary_text: primary,
            history: self.transcript.recent_outputs(id, history_turns).await,
            character_id: self.transcript.character_id().await,
        };

        let raw = match self.generator.generate(&input).await {
            Ok(Some(raw)) if !raw.trim().is_empty() => raw,
            Ok(_) => {
                info!(message_id = %id, "No auxiliary response");
                self.notices.warning("Auxiliary model returned no response");
                return Outcome::NoContent;
            }
            // Settings changed between the readiness check and the call.
            Err(GeneratorError::Config(e)) => return self.misconfigured(id, &e),
            Err(e) => return self.fail(id, &e.to_string()),
        };

        let instructions = match markers::parse(&raw) {
            Some(set) if set.has_content() => set,
            _ => {
                info!(message_id = %id, raw_len = raw.len(), "No changes to message");
                self.notices.info(trigger.empty_notice());
                return Outcome::NoContent;
            }
        };

        let primary = input.primary_text;
        let rendered = markers::merge(&primary, Some(&instructions));
        let blocks = instructions.block_count();
        let original_len = primary.len();
        let commit = AugmentationCommit {
            primary_original: primary,
            raw_output: raw,
            instructions,
        };
        if let Err(e) = self.transcript.commit_augmentation(id, commit).await {
            return self.fail(id, &e.to_string());
        }

        self.render(id, &rendered).await;
        info!(
            message_id = %id,
            blocks,
            original_len,
            rendered_len = rendered.len(),
            "Auxiliary content merged"
        );
        self.notices.success(trigger.merged_notice());
        Outcome::Merged { rendered }
    }

    /// Re-render and open the suppression window so the host's echo of
    /// this render is not mistaken for a user edit.
    async fn render(&self, id: MessageId, text: &str) {
        let window = Duration::from_millis(self.settings.snapshot().await.edit_suppression_ms);
        self.suppression.open(window);
        self.transcript.render(id, text);
    }

    /// Checked before any state is touched, so a missing profile leaves the
    /// message eligible for a later arrival.
    async fn preflight(&self, id: MessageId) -> Result<(), Outcome> {
        match self.generator.check_ready().await {
            Ok(()) => Ok(()),
            Err(GeneratorError::Config(e)) => Err(self.misconfigured(id, &e)),
            Err(e) => Err(self.fail(id, &e.to_string())),
        }
    }

    fn misconfigured(&self, id: MessageId, error: &ConfigError) -> Outcome {
        warn!(message_id = %id, error = %error, "Auxiliary generator not configured");
        self.notices.warning(format!("Configuration error: {error}"));
        Outcome::Skipped(SkipReason::NotConfigured)
    }

    fn fail(&self, id: MessageId, reason: &str) -> Outcome {
        error!(message_id = %id, error = %reason, "Auxiliary processing failed");
        self.notices.error(format!("Error: {reason}"));
        Outcome::Failed {
            reason: reason.to_string(),
        }
    }

    fn in_flight_phase(&self, id: MessageId) -> Option<MessagePhase> {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
    }

    fn transition(&self, id: MessageId, from: MessagePhase, to: MessagePhase) {
        if from.can_transition_to(to) {
            debug!(message_id = %id, from = %from, to = %to, "Phase transition");
        } else {
            warn!(message_id = %id, from = %from, to = %to, "Unexpected phase transition");
        }
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        if to.is_transient() {
            phases.insert(id, to);
        } else {
            phases.remove(&id);
        }
    }
}

/// Feed transcript events to the controller.
///
/// Each event runs on its own task so a trigger arriving mid-generation
/// observes the held gate instead of queueing behind it.
pub fn spawn_event_loop(
    controller: Arc<Controller>,
    mut events: mpsc::UnboundedReceiver<TranscriptEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reconcile event loop started");
        while let Some(event) = events.recv().await {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                let outcome = controller.handle(event.clone()).await;
                debug!(event = ?event, outcome = ?outcome, "Event handled");
            });
        }
        info!("Reconcile event loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::config::Settings;
    use crate::error::{GeneratorError, LlmError};
    use crate::reconcile::notice::NoticeLevel;
    use crate::transcript::MemoryTranscript;

    /// Returns queued responses in order; `Err` entries become LLM failures.
    #[derive(Default)]
    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<Option<String>, String>>>,
        inputs: Mutex<Vec<GenerationInput>>,
        calls: AtomicUsize,
        release: Option<Arc<Notify>>,
    }

    impl ScriptedGenerator {
        fn replying(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(
                    responses.iter().map(|r| Ok(Some(r.to_string()))).collect(),
                ),
                ..Default::default()
            }
        }

        fn failing(reason: &str) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from([Err(reason.to_string())])),
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl SecondaryGenerator for ScriptedGenerator {
        async fn generate(&self, input: &GenerationInput) -> Result<Option<String>, GeneratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.clone());
            if let Some(release) = &self.release {
                release.notified().await;
            }
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(output)) => Ok(output),
                Some(Err(reason)) => Err(LlmError::RequestFailed {
                    provider: "scripted".into(),
                    reason,
                }
                .into()),
                None => Ok(None),
            }
        }
    }

    fn enabled(suppression_ms: u64) -> Arc<SettingsManager> {
        Arc::new(SettingsManager::new(Settings {
            enabled: true,
            edit_suppression_ms: suppression_ms,
            ..Default::default()
        }))
    }

    fn setup(
        generator: ScriptedGenerator,
        suppression_ms: u64,
    ) -> (Arc<Controller>, Arc<MemoryTranscript>, Arc<ScriptedGenerator>) {
        let transcript = Arc::new(MemoryTranscript::new(None));
        let generator = Arc::new(generator);
        let controller = Arc::new(Controller::new(
            enabled(suppression_ms),
            transcript.clone(),
            generator.clone(),
        ));
        (controller, transcript, generator)
    }

    fn drain(rx: &mut broadcast::Receiver<Notice>) -> Vec<(NoticeLevel, String)> {
        let mut notices = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notices.push((notice.level, notice.message));
        }
        notices
    }

    #[tokio::test]
    async fn arrival_merges_and_commits() {
        let (controller, transcript, _) =
            setup(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"]), 0);
        let mut notices = controller.subscribe_notices();
        transcript.push_message(true, "hi");
        let id = transcript.push_message(false, "A\n\nB");

        let outcome = controller.on_message_received(None).await;
        assert_eq!(
            outcome,
            Outcome::Merged {
                rendered: "A\n\nB\n\nX".into()
            }
        );
        assert_eq!(transcript.text(id).as_deref(), Some("A\n\nB\n\nX"));

        let state = transcript.message(id).await.unwrap().augmentation;
        assert!(state.processed);
        assert_eq!(state.primary_original.as_deref(), Some("A\n\nB"));
        assert_eq!(state.raw_output.as_deref(), Some("[APPEND]X[/APPEND]"));
        assert_eq!(controller.phase(id).await, Some(MessagePhase::Merged));
        assert!(!controller.is_busy());

        assert_eq!(
            drain(&mut notices),
            vec![
                (NoticeLevel::Info, "Generating with auxiliary model...".to_string()),
                (NoticeLevel::Success, "Auxiliary content merged".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn disabled_arrival_is_silent() {
        let transcript = Arc::new(MemoryTranscript::new(None));
        let generator = Arc::new(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"]));
        let controller = Controller::new(
            Arc::new(SettingsManager::new(Settings::default())),
            transcript.clone(),
            generator.clone(),
        );
        let mut notices = controller.subscribe_notices();
        transcript.push_message(false, "A");

        assert_eq!(
            controller.on_message_received(None).await,
            Outcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut notices).is_empty());

        assert_eq!(
            controller.regenerate(MessageId(0)).await,
            Outcome::Skipped(SkipReason::Disabled)
        );
        assert_eq!(drain(&mut notices)[0].0, NoticeLevel::Warning);
    }

    #[tokio::test]
    async fn user_and_processed_messages_are_skipped() {
        let (controller, transcript, generator) =
            setup(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"]), 0);
        let user = transcript.push_message(true, "question");
        let reply = transcript.push_message(false, "answer");
        transcript.mark_processed(reply).await.unwrap();

        assert_eq!(
            controller.on_message_received(Some(user)).await,
            Outcome::Skipped(SkipReason::UserMessage)
        );
        assert_eq!(
            controller.on_message_received(Some(reply)).await,
            Outcome::Skipped(SkipReason::AlreadyProcessed)
        );
        assert_eq!(
            controller.on_message_received(Some(MessageId(42))).await,
            Outcome::Skipped(SkipReason::NotFound)
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(!controller.is_busy());
    }

    #[tokio::test]
    async fn concurrent_triggers_run_one_generation() {
        let release = Arc::new(Notify::new());
        let generator = ScriptedGenerator {
            release: Some(release.clone()),
            ..ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"])
        };
        let (controller, transcript, generator) = setup(generator, 0);
        let mut notices = controller.subscribe_notices();
        let id = transcript.push_message(false, "A\n\nB");

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.on_message_received(Some(id)).await }
        });
        while generator.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(controller.is_busy());
        assert_eq!(controller.phase(id).await, Some(MessagePhase::Generating));

        assert_eq!(
            controller.on_message_received(Some(id)).await,
            Outcome::Skipped(SkipReason::Busy)
        );
        assert_eq!(
            controller.regenerate(id).await,
            Outcome::Skipped(SkipReason::Busy)
        );
        assert_eq!(
            controller.on_message_edited(id).await,
            Outcome::Skipped(SkipReason::Busy)
        );

        release.notify_one();
        assert!(matches!(first.await.unwrap(), Outcome::Merged { .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(!controller.is_busy());

        let messages: Vec<String> = drain(&mut notices).into_iter().map(|(_, m)| m).collect();
        assert!(messages.contains(&"Already processing".to_string()));
    }

    #[tokio::test]
    async fn whitespace_only_blocks_report_no_changes() {
        let (controller, transcript, _) = setup(
            ScriptedGenerator::replying(&["[PREPEND]   [/PREPEND][APPEND]\n[/APPEND]"]),
            0,
        );
        let mut notices = controller.subscribe_notices();
        let id = transcript.push_message(false, "A\n\nB");

        assert_eq!(controller.on_message_received(Some(id)).await, Outcome::NoContent);
        assert_eq!(transcript.text(id).as_deref(), Some("A\n\nB"));
        let state = transcript.message(id).await.unwrap().augmentation;
        assert!(state.processed);
        assert!(state.raw_output.is_none());
        assert_eq!(controller.phase(id).await, Some(MessagePhase::Processed));
        assert_eq!(transcript.render_count(), 0);
        assert_eq!(
            drain(&mut notices).last().unwrap(),
            &(NoticeLevel::Info, "No auxiliary content to merge".to_string())
        );
    }

    #[tokio::test]
    async fn empty_response_warns() {
        let (controller, transcript, _) = setup(ScriptedGenerator::default(), 0);
        let mut notices = controller.subscribe_notices();
        transcript.push_message(false, "A");

        assert_eq!(controller.on_message_received(None).await, Outcome::NoContent);
        assert_eq!(
            drain(&mut notices).last().unwrap(),
            &(
                NoticeLevel::Warning,
                "Auxiliary model returned no response".to_string()
            )
        );
    }

    #[tokio::test]
    async fn generator_error_releases_gate_and_keeps_processed() {
        let (controller, transcript, generator) = setup(ScriptedGenerator::failing("timeout"), 0);
        let mut notices = controller.subscribe_notices();
        let id = transcript.push_message(false, "A\n\nB");

        let outcome = controller.on_message_received(Some(id)).await;
        assert!(matches!(outcome, Outcome::Failed { ref reason } if reason.contains("timeout")));
        assert!(!controller.is_busy());
        assert_eq!(transcript.text(id).as_deref(), Some("A\n\nB"));
        assert!(transcript.message(id).await.unwrap().augmentation.processed);

        let (level, message) = drain(&mut notices).pop().unwrap();
        assert_eq!(level, NoticeLevel::Error);
        assert!(message.starts_with("Error: "));

        // No automatic retry on the next arrival.
        assert_eq!(
            controller.on_message_received(Some(id)).await,
            Outcome::Skipped(SkipReason::AlreadyProcessed)
        );
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn edit_reapplies_stored_instructions() {
        let (controller, transcript, generator) =
            setup(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"]), 0);
        let id = transcript.push_message(false, "A\n\nB");
        controller.on_message_received(Some(id)).await;

        transcript.edit_text(id, "A\n\nC\n\nX").unwrap();
        let outcome = controller.on_message_edited(id).await;
        // The append block is applied again on top of the edited text.
        assert_eq!(
            outcome,
            Outcome::Remerged {
                rendered: "A\n\nC\n\nX\n\nX".into()
            }
        );
        assert_eq!(transcript.text(id).as_deref(), Some("A\n\nC\n\nX\n\nX"));
        let state = transcript.message(id).await.unwrap().augmentation;
        assert_eq!(state.primary_original.as_deref(), Some("A\n\nC\n\nX"));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.phase(id).await, Some(MessagePhase::Merged));
    }

    #[tokio::test]
    async fn unchanged_edit_is_a_no_op() {
        let (controller, transcript, _) =
            setup(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"]), 0);
        let id = transcript.push_message(false, "A\n\nB");
        controller.on_message_received(Some(id)).await;
        let renders = transcript.render_count();

        assert_eq!(controller.on_message_edited(id).await, Outcome::Unchanged);
        assert_eq!(transcript.render_count(), renders);
    }

    #[tokio::test]
    async fn edit_without_stored_state_is_ignored() {
        let (controller, transcript, _) = setup(ScriptedGenerator::default(), 0);
        let id = transcript.push_message(false, "plain");
        assert_eq!(
            controller.on_message_edited(id).await,
            Outcome::Skipped(SkipReason::NothingStored)
        );
    }

    #[tokio::test]
    async fn edits_inside_suppression_window_are_ignored() {
        let (controller, transcript, _) =
            setup(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"]), 60_000);
        let id = transcript.push_message(false, "A\n\nB");
        controller.on_message_received(Some(id)).await;

        transcript.edit_text(id, "changed").unwrap();
        assert_eq!(
            controller.on_message_edited(id).await,
            Outcome::Skipped(SkipReason::Suppressed)
        );
        let state = transcript.message(id).await.unwrap().augmentation;
        assert_eq!(state.primary_original.as_deref(), Some("A\n\nB"));
    }

    #[tokio::test]
    async fn regenerate_uses_stored_primary_text() {
        let (controller, transcript, generator) = setup(
            ScriptedGenerator::replying(&["[APPEND]X[/APPEND]", "[PREPEND]S[/PREPEND]"]),
            0,
        );
        let mut notices = controller.subscribe_notices();
        let id = transcript.push_message(false, "A\n\nB");
        controller.on_message_received(Some(id)).await;
        drain(&mut notices);

        let outcome = controller.regenerate(id).await;
        assert_eq!(
            outcome,
            Outcome::Merged {
                rendered: "S\n\nA\n\nB".into()
            }
        );
        assert_eq!(transcript.text(id).as_deref(), Some("S\n\nA\n\nB"));
        let inputs = generator.inputs.lock().unwrap();
        assert_eq!(inputs[1].primary_text, "A\n\nB");

        let messages: Vec<String> = drain(&mut notices).into_iter().map(|(_, m)| m).collect();
        assert_eq!(
            messages,
            vec![
                "Regenerating auxiliary response...".to_string(),
                "Auxiliary response regenerated".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn regenerate_marks_untouched_message_processed() {
        let (controller, transcript, _) = setup(ScriptedGenerator::default(), 0);
        let id = transcript.push_message(false, "A");
        assert_eq!(controller.regenerate_last().await, Outcome::NoContent);
        assert!(transcript.message(id).await.unwrap().augmentation.processed);
    }

    #[tokio::test]
    async fn regenerate_rejects_invalid_targets() {
        let (controller, transcript, _) = setup(ScriptedGenerator::default(), 0);
        let mut notices = controller.subscribe_notices();

        assert_eq!(
            controller.regenerate_last().await,
            Outcome::Skipped(SkipReason::NotFound)
        );
        let user = transcript.push_message(true, "hello");
        assert_eq!(
            controller.regenerate(user).await,
            Outcome::Skipped(SkipReason::UserMessage)
        );
        let messages: Vec<String> = drain(&mut notices).into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages, vec!["Invalid message", "Invalid message"]);
    }

    #[tokio::test]
    async fn history_comes_from_earlier_outputs() {
        let (controller, transcript, generator) = setup(
            ScriptedGenerator::replying(&["[APPEND]one[/APPEND]", "[APPEND]two[/APPEND]"]),
            0,
        );
        let first = transcript.push_message(false, "first reply");
        controller.on_message_received(Some(first)).await;
        transcript.push_message(true, "next question");
        let second = transcript.push_message(false, "second reply");
        controller.on_message_received(Some(second)).await;

        let inputs = generator.inputs.lock().unwrap();
        assert!(inputs[0].history.is_empty());
        assert_eq!(inputs[1].history.len(), 1);
        assert_eq!(inputs[1].history[0].main, "first reply");
        assert_eq!(inputs[1].history[0].raw_output, "[APPEND]one[/APPEND]");
    }

    /// Completes with a fixed marker response.
    struct FixedLlm;

    #[async_trait::async_trait]
    impl crate::llm::LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn complete(
            &self,
            _request: crate::llm::CompletionRequest,
        ) -> Result<crate::llm::CompletionResponse, LlmError> {
            Ok(crate::llm::CompletionResponse {
                content: "[APPEND]X[/APPEND]".into(),
                input_tokens: 10,
                output_tokens: 5,
                finish_reason: crate::llm::FinishReason::Stop,
                response_id: None,
            })
        }
    }

    struct FixedFactory;

    impl crate::generator::ProviderFactory for FixedFactory {
        fn provider(
            &self,
            _profile: &crate::config::ConnectionProfile,
        ) -> Result<Arc<dyn crate::llm::LlmProvider>, GeneratorError> {
            Ok(Arc::new(FixedLlm))
        }
    }

    #[tokio::test]
    async fn missing_profile_leaves_message_untouched() {
        let settings = enabled(0);
        let transcript = Arc::new(MemoryTranscript::new(None));
        let generator = Arc::new(crate::generator::AuxGenerator::new(
            settings.clone(),
            Arc::new(FixedFactory),
        ));
        let controller = Controller::new(settings.clone(), transcript.clone(), generator);
        let mut notices = controller.subscribe_notices();
        let id = transcript.push_message(false, "A");

        assert_eq!(
            controller.on_message_received(Some(id)).await,
            Outcome::Skipped(SkipReason::NotConfigured)
        );
        assert!(!transcript.message(id).await.unwrap().augmentation.processed);
        assert!(!controller.is_busy());
        let seen = drain(&mut notices);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, NoticeLevel::Warning);
        assert!(seen[0].1.starts_with("Configuration error: "));

        assert_eq!(
            controller.regenerate(id).await,
            Outcome::Skipped(SkipReason::NotConfigured)
        );
        assert!(!transcript.message(id).await.unwrap().augmentation.processed);

        // Once a profile is selected the same message is still picked up.
        settings
            .update(|s| {
                s.profiles.push(crate::config::ConnectionProfile {
                    id: "aux".into(),
                    name: None,
                    api: Some(crate::config::ProfileApi::OpenAi),
                    base_url: None,
                    model: "gpt-4o-mini".into(),
                    api_key_env: None,
                    max_tokens: None,
                });
                s.connection_profile_id = Some("aux".into());
            })
            .await
            .unwrap();
        assert_eq!(
            controller.on_message_received(Some(id)).await,
            Outcome::Merged {
                rendered: "A\n\nX".into()
            }
        );
    }

    #[tokio::test]
    async fn empty_string_counts_as_no_response() {
        let (controller, transcript, _) = setup(ScriptedGenerator::replying(&[""]), 0);
        let mut notices = controller.subscribe_notices();
        let id = transcript.push_message(false, "A");

        assert_eq!(controller.on_message_received(Some(id)).await, Outcome::NoContent);
        assert_eq!(
            drain(&mut notices).last().unwrap(),
            &(
                NoticeLevel::Warning,
                "Auxiliary model returned no response".to_string()
            )
        );
    }

    /// Memory transcript whose `set_primary_original` always fails.
    struct ReadOnlyOriginals(MemoryTranscript);

    #[async_trait::async_trait]
    impl Transcript for ReadOnlyOriginals {
        async fn message(&self, id: MessageId) -> Option<TranscriptMessage> {
            self.0.message(id).await
        }

        async fn last_id(&self) -> Option<MessageId> {
            self.0.last_id().await
        }

        async fn character_id(&self) -> Option<String> {
            None
        }

        async fn mark_processed(&self, id: MessageId) -> Result<(), crate::error::TranscriptError> {
            self.0.mark_processed(id).await
        }

        async fn commit_augmentation(
            &self,
            id: MessageId,
            commit: AugmentationCommit,
        ) -> Result<(), crate::error::TranscriptError> {
            self.0.commit_augmentation(id, commit).await
        }

        async fn set_primary_original(
            &self,
            _id: MessageId,
            _text: &str,
        ) -> Result<(), crate::error::TranscriptError> {
            Err(std::io::Error::other("disk full").into())
        }

        fn render(&self, id: MessageId, text: &str) {
            self.0.render(id, text)
        }
    }

    #[tokio::test]
    async fn failed_edit_store_raises_error_notice() {
        let transcript = Arc::new(ReadOnlyOriginals(MemoryTranscript::new(None)));
        let controller = Controller::new(
            enabled(0),
            transcript.clone(),
            Arc::new(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"])),
        );
        let id = transcript.0.push_message(false, "A\n\nB");
        controller.on_message_received(Some(id)).await;
        let mut notices = controller.subscribe_notices();

        transcript.0.edit_text(id, "changed").unwrap();
        let outcome = controller.on_message_edited(id).await;
        assert!(matches!(outcome, Outcome::Failed { ref reason } if reason.contains("disk full")));
        let (level, message) = drain(&mut notices).pop().unwrap();
        assert_eq!(level, NoticeLevel::Error);
        assert!(message.starts_with("Error: "));
        assert_eq!(controller.phase(id).await, Some(MessagePhase::Merged));
    }

    #[tokio::test]
    async fn zero_history_turns_uses_default() {
        let settings = Arc::new(SettingsManager::new(Settings {
            enabled: true,
            history_turns: 0,
            edit_suppression_ms: 0,
            ..Default::default()
        }));
        let transcript = Arc::new(MemoryTranscript::new(None));
        let generator = Arc::new(ScriptedGenerator::replying(&[
            "[APPEND]one[/APPEND]",
            "[APPEND]two[/APPEND]",
        ]));
        let controller = Controller::new(settings, transcript.clone(), generator.clone());
        let first = transcript.push_message(false, "first");
        controller.on_message_received(Some(first)).await;
        let second = transcript.push_message(false, "second");
        controller.on_message_received(Some(second)).await;

        assert_eq!(generator.inputs.lock().unwrap()[1].history.len(), 1);
    }

    #[tokio::test]
    async fn event_loop_dispatches_events() {
        let (controller, transcript, _) =
            setup(ScriptedGenerator::replying(&["[APPEND]X[/APPEND]"]), 0);
        let mut notices = controller.subscribe_notices();
        let id = transcript.push_message(false, "A");

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_event_loop(controller.clone(), rx);
        tx.send(TranscriptEvent::Received { id: None }).unwrap();

        let merged = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notice = notices.recv().await.unwrap();
                if notice.level == NoticeLevel::Success {
                    return notice.message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(merged, "Auxiliary content merged");
        assert_eq!(transcript.text(id).as_deref(), Some("A\n\nX"));

        drop(tx);
        handle.await.unwrap();
    }
}
