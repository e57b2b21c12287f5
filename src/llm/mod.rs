//! LLM integration for the auxiliary generator.
//!
//! Supports:
//! - **OpenAI-compatible**: `/chat/completions` (OpenAI, local servers, proxies)
//! - **Anthropic**: `/v1/messages`
//!
//! Both go through [`HttpProvider`], which implements [`LlmProvider`].

pub mod http;
pub mod provider;

pub use http::HttpProvider;
pub use provider::*;

use std::sync::Arc;

use secrecy::SecretString;

use crate::config::{ConnectionProfile, ProfileApi};
use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }

    /// Environment variable consulted when a profile names none.
    pub fn default_key_env(&self) -> &'static str {
        match self {
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }
}

impl From<ProfileApi> for LlmBackend {
    fn from(api: ProfileApi) -> Self {
        match api {
            ProfileApi::OpenAi => Self::OpenAi,
            ProfileApi::Anthropic => Self::Anthropic,
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
    pub base_url: Option<String>,
}

impl LlmConfig {
    /// Resolve a connection profile into a provider config.
    ///
    /// Fails when the profile has no API set or its key variable is unset.
    pub fn from_profile(profile: &ConnectionProfile) -> Result<Self, ConfigError> {
        let backend: LlmBackend = profile
            .api
            .ok_or_else(|| ConfigError::MissingRequired {
                key: format!("profiles[{}].api", profile.id),
                hint: format!("Profile \"{}\" has no API configured", profile.label()),
            })?
            .into();

        let key_env = profile
            .api_key_env
            .as_deref()
            .unwrap_or(backend.default_key_env());
        let api_key = std::env::var(key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(key_env.to_string()))?;

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: profile.model.clone(),
            base_url: profile.base_url.clone(),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = HttpProvider::new(
        config.backend,
        config.base_url.as_deref(),
        config.api_key.clone(),
        &config.model,
    )?;
    tracing::info!(
        "Using {} (model: {})",
        config.backend.name(),
        config.model
    );
    Ok(Arc::new(provider))
}
