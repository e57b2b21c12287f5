//! Secondary (auxiliary) generator.
//!
//! [`AuxGenerator`] turns the current primary text into a prompt (lore,
//! asset format, earlier outputs) and sends it to the selected connection
//! profile. The raw completion is returned untouched; parsing happens in
//! [`crate::markers`].

pub mod prompt;

pub use prompt::{PromptValues, build_prompt, format_history};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{
    ConnectionProfile, Settings, SettingsManager, asset_format_option, effective_asset_format_id,
};
use crate::error::{ConfigError, GeneratorError};
use crate::llm::{ChatMessage, CompletionRequest, LlmConfig, LlmProvider, create_provider};
use crate::lore::{self, LoreSource, MacroExpander, NoMacros};
use crate::transcript::{HistoryTurn, MessageId};

/// Everything the generator sees about the message being augmented.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    pub message_id: MessageId,
    pub primary_text: String,
    /// Earlier exchanges, oldest first.
    pub history: Vec<HistoryTurn>,
    pub character_id: Option<String>,
}

/// Produces raw secondary output for a primary message.
///
/// `Ok(None)` means the generator had nothing to say.
#[async_trait]
pub trait SecondaryGenerator: Send + Sync {
    /// Fails when the current settings cannot produce a generation at all.
    async fn check_ready(&self) -> Result<(), GeneratorError> {
        Ok(())
    }

    async fn generate(&self, input: &GenerationInput) -> Result<Option<String>, GeneratorError>;
}

/// Builds a provider for a connection profile.
pub trait ProviderFactory: Send + Sync {
    fn provider(&self, profile: &ConnectionProfile) -> Result<Arc<dyn LlmProvider>, GeneratorError>;
}

/// Resolves profiles to [`crate::llm::HttpProvider`]s.
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn provider(&self, profile: &ConnectionProfile) -> Result<Arc<dyn LlmProvider>, GeneratorError> {
        let config = LlmConfig::from_profile(profile)?;
        Ok(create_provider(&config)?)
    }
}

/// Generator readiness, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorStatus {
    Disabled,
    NoProfile,
    Ready { profile: String },
}

impl GeneratorStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

impl std::fmt::Display for GeneratorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::NoProfile => write!(f, "No profile"),
            Self::Ready { profile } => write!(f, "{profile}"),
        }
    }
}

/// LLM-backed [`SecondaryGenerator`].
pub struct AuxGenerator {
    settings: Arc<SettingsManager>,
    providers: Arc<dyn ProviderFactory>,
    lore: Option<Arc<dyn LoreSource>>,
    macros: Arc<dyn MacroExpander>,
}

impl AuxGenerator {
    pub fn new(settings: Arc<SettingsManager>, providers: Arc<dyn ProviderFactory>) -> Self {
        Self {
            settings,
            providers,
            lore: None,
            macros: Arc::new(NoMacros),
        }
    }

    pub fn with_lore(mut self, lore: Arc<dyn LoreSource>) -> Self {
        self.lore = Some(lore);
        self
    }

    pub fn with_macros(mut self, macros: Arc<dyn MacroExpander>) -> Self {
        self.macros = macros;
        self
    }

    pub async fn status(&self) -> GeneratorStatus {
        let settings = self.settings.snapshot().await;
        if !settings.enabled {
            return GeneratorStatus::Disabled;
        }
        match settings.selected_profile() {
            Some(profile) => GeneratorStatus::Ready {
                profile: profile.label().to_string(),
            },
            None => GeneratorStatus::NoProfile,
        }
    }
}

/// The selected connection profile, or why there is none.
fn resolve_profile(settings: &Settings) -> Result<&ConnectionProfile, ConfigError> {
    let profile_id = settings
        .connection_profile_id
        .as_deref()
        .ok_or_else(|| ConfigError::MissingRequired {
            key: "connection_profile_id".to_string(),
            hint: "Select a connection profile for the auxiliary model".to_string(),
        })?;
    settings
        .selected_profile()
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "connection_profile_id".to_string(),
            message: format!("Profile not found: {profile_id}"),
        })
}

#[async_trait]
impl SecondaryGenerator for AuxGenerator {
    async fn check_ready(&self) -> Result<(), GeneratorError> {
        let settings = self.settings.snapshot().await;
        if !settings.enabled {
            return Ok(());
        }
        let profile = resolve_profile(&settings)?;
        self.providers.provider(profile)?;
        Ok(())
    }

    async fn generate(&self, input: &GenerationInput) -> Result<Option<String>, GeneratorError> {
        let settings = self.settings.snapshot().await;
        if !settings.enabled {
            debug!("Auxiliary generator disabled");
            return Ok(None);
        }

        let profile = resolve_profile(&settings)?;
        let provider = self.providers.provider(profile)?;

        let world_info = match &self.lore {
            Some(source) => {
                lore::retrieve(source.as_ref(), &settings.lore_keyword, self.macros.as_ref()).await
            }
            None => String::new(),
        };
        let asset_format = asset_format_option(effective_asset_format_id(
            &settings,
            input.character_id.as_deref(),
        ));
        let prompt = build_prompt(
            &settings.prompt_template,
            &PromptValues {
                world_info: &world_info,
                last_message: &input.primary_text,
                asset_format,
                asset_count: settings.asset_count,
                history: &input.history,
            },
        );

        let mut request = CompletionRequest::new(vec![ChatMessage::user(prompt)]);
        let max_tokens = Some(settings.max_tokens)
            .filter(|t| *t > 0)
            .or(profile.max_tokens);
        if let Some(max_tokens) = max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        info!(
            message_id = %input.message_id,
            profile = %profile.label(),
            model = %provider.model_name(),
            history = input.history.len(),
            "Starting auxiliary generation"
        );
        let response = provider.complete(request).await?;
        debug!(
            message_id = %input.message_id,
            output_tokens = response.output_tokens,
            finish_reason = ?response.finish_reason,
            "Auxiliary response received"
        );

        if response.content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(response.content))
    }
}
