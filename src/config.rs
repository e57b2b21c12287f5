//! Configuration types.
//!
//! Settings are layered: a global [`Settings`] record plus optional
//! per-character [`CharacterSettings`] overrides. The `effective_*` functions
//! resolve a value explicitly (override present and enabled, else global).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Default prompt sent to the auxiliary generator.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are an auxiliary AI that adds asset commands and status displays to roleplay responses.

[Reference Data]
{{worldInfo}}

[Current Response]
{{lastMessage}}

[Previous Auxiliary Outputs]
{{auxHistory}}

[CRITICAL: POSITION MARKERS ARE MANDATORY]
Every piece of content you output MUST be wrapped in position markers. Content without position markers will be DISCARDED.

Available position markers:
- [PREPEND]content here[/PREPEND] → Inserts at the BEGINNING of the response
- [APPEND]content here[/APPEND] → Inserts at the END of the response
- [INSERT:N]content here[/INSERT] → Inserts after the Nth paragraph (N=1 means after first paragraph)

[Instructions]
- ALL output MUST be inside position markers
- Use ONLY the assets and status formats defined in Reference Data above
- Do NOT create or reference any assets not listed in Reference Data
- Generate up to {{assetCount}} asset commands maximum
- Maintain consistency with your previous outputs shown above (if any)
- Asset command format: {{assetFormat}}

[Output Rules]
1. No output without position markers
2. No translations of any kind
3. No explanations, commentary, or descriptions
4. No repetition or paraphrasing of the original response
5. If no appropriate assets exist, output nothing

[Example Output]
[PREPEND]
<status>
hp: 100
location: forest
</status>
[/PREPEND]
[APPEND]
{{assetExample}}
[/APPEND]";

/// Keyword that marks lore entries meant for the auxiliary generator.
pub const DEFAULT_LORE_KEYWORD: &str = "auxmodel";

/// Default asset format option id.
pub const DEFAULT_ASSET_FORMAT_ID: &str = "percent";

/// Default suppression window after a programmatic re-render.
pub const DEFAULT_EDIT_SUPPRESSION_MS: u64 = 100;

/// History depth used when the setting is 0.
pub const DEFAULT_HISTORY_TURNS: usize = 2;

/// Upper bound on history depth.
pub const MAX_HISTORY_TURNS: usize = 10;

/// A built-in asset command syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetFormatOption {
    pub id: &'static str,
    pub start: &'static str,
    pub end: &'static str,
    pub name: &'static str,
    pub example: &'static str,
}

/// Asset command syntaxes the generator can be asked to emit.
pub const ASSET_FORMAT_OPTIONS: [AssetFormatOption; 2] = [
    AssetFormatOption {
        id: "percent",
        start: "%%img:",
        end: "%%",
        name: "Percent format (%%img:file.png%%)",
        example: "%%img:smile.png%%",
    },
    AssetFormatOption {
        id: "curly",
        start: "{{img::",
        end: "}}",
        name: "Curly brace format ({{img::file.png}})",
        example: "{{img::smile.png}}",
    },
];

/// Look up an asset format option, falling back to the first one.
pub fn asset_format_option(id: &str) -> &'static AssetFormatOption {
    ASSET_FORMAT_OPTIONS
        .iter()
        .find(|f| f.id == id)
        .unwrap_or(&ASSET_FORMAT_OPTIONS[0])
}

/// A start/end delimiter pair describing a status or asset block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPair {
    pub start: String,
    pub end: String,
    pub name: String,
}

impl FormatPair {
    pub fn new(start: impl Into<String>, end: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            name: name.into(),
        }
    }
}

fn default_status_formats() -> Vec<FormatPair> {
    vec![FormatPair::new("[Status]", "[/Status]", "Status block")]
}

/// Which wire protocol a connection profile speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileApi {
    OpenAi,
    Anthropic,
}

/// A named generator endpoint.
///
/// The API key is never stored; `api_key_env` names the environment
/// variable holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api: Option<ProfileApi>,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ConnectionProfile {
    /// Display label: name when set, otherwise id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Per-character overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterSettings {
    pub use_character_status_formats: bool,
    pub status_formats: Vec<FormatPair>,
    pub use_character_asset_formats: bool,
    pub asset_formats: Vec<FormatPair>,
    pub asset_format_id: Option<String>,
    /// Selected lore entries as `book::uid` keys.
    pub selected_lore_entries: Vec<String>,
}

impl Default for CharacterSettings {
    fn default() -> Self {
        Self {
            use_character_status_formats: false,
            status_formats: Vec::new(),
            use_character_asset_formats: false,
            asset_formats: Vec::new(),
            asset_format_id: Some(DEFAULT_ASSET_FORMAT_ID.to_string()),
            selected_lore_entries: Vec::new(),
        }
    }
}

/// Global settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether new messages trigger auxiliary generation.
    pub enabled: bool,
    /// Selected connection profile id.
    pub connection_profile_id: Option<String>,
    /// Known connection profiles.
    pub profiles: Vec<ConnectionProfile>,
    /// Prompt template with `{{placeholder}}` slots.
    pub prompt_template: String,
    pub asset_format_id: String,
    pub status_formats: Vec<FormatPair>,
    pub asset_formats: Vec<FormatPair>,
    /// Max tokens for the generator call (0 defers to the profile).
    pub max_tokens: u32,
    /// Max asset commands requested per message.
    pub asset_count: u32,
    /// Keyword selecting lore entries for the prompt.
    pub lore_keyword: String,
    /// Previous outputs shown to the generator (0 means the default).
    pub history_turns: usize,
    /// Edit notifications are ignored this long after a re-render.
    pub edit_suppression_ms: u64,
    pub character_settings: HashMap<String, CharacterSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            connection_profile_id: None,
            profiles: Vec::new(),
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            asset_format_id: DEFAULT_ASSET_FORMAT_ID.to_string(),
            status_formats: default_status_formats(),
            asset_formats: Vec::new(),
            max_tokens: 4096,
            asset_count: 3,
            lore_keyword: DEFAULT_LORE_KEYWORD.to_string(),
            history_turns: DEFAULT_HISTORY_TURNS,
            edit_suppression_ms: DEFAULT_EDIT_SUPPRESSION_MS,
            character_settings: HashMap::new(),
        }
    }
}

impl Settings {
    /// The currently selected profile, if it exists.
    pub fn selected_profile(&self) -> Option<&ConnectionProfile> {
        let id = self.connection_profile_id.as_deref()?;
        self.profiles.iter().find(|p| p.id == id)
    }

    /// History depth to use: 0 falls back to the default, large values are capped.
    pub fn effective_history_turns(&self) -> usize {
        match self.history_turns {
            0 => DEFAULT_HISTORY_TURNS,
            turns => turns.min(MAX_HISTORY_TURNS),
        }
    }
}

/// Values read from `AUXMERGE_*` environment variables.
///
/// Layered over the stored settings when they are read and never written
/// back to the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub enabled: Option<bool>,
    /// `Some(None)` clears the selected profile.
    pub connection_profile_id: Option<Option<String>>,
    pub max_tokens: Option<u32>,
    pub asset_count: Option<u32>,
    pub lore_keyword: Option<String>,
    pub history_turns: Option<usize>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: env_parse("AUXMERGE_ENABLED")?,
            connection_profile_id: std::env::var("AUXMERGE_PROFILE_ID").ok().map(|profile| {
                let profile = profile.trim();
                (!profile.is_empty()).then(|| profile.to_string())
            }),
            max_tokens: env_parse("AUXMERGE_MAX_TOKENS")?,
            asset_count: env_parse("AUXMERGE_ASSET_COUNT")?,
            lore_keyword: std::env::var("AUXMERGE_LORE_KEYWORD").ok(),
            history_turns: env_parse("AUXMERGE_HISTORY_TURNS")?,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, settings: &mut Settings) {
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(profile) = &self.connection_profile_id {
            settings.connection_profile_id = profile.clone();
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
        if let Some(asset_count) = self.asset_count {
            settings.asset_count = asset_count;
        }
        if let Some(keyword) = &self.lore_keyword {
            settings.lore_keyword = keyword.clone();
        }
        if let Some(turns) = self.history_turns {
            settings.history_turns = turns;
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

// ── Resolution ──────────────────────────────────────────────────────

fn character<'a>(settings: &'a Settings, character_id: Option<&str>) -> Option<&'a CharacterSettings> {
    character_id.and_then(|id| settings.character_settings.get(id))
}

/// Status formats for a character, or the global list.
pub fn effective_status_formats<'a>(settings: &'a Settings, character_id: Option<&str>) -> &'a [FormatPair] {
    match character(settings, character_id) {
        Some(c) if c.use_character_status_formats => &c.status_formats,
        _ => &settings.status_formats,
    }
}

/// Asset formats for a character, or the global list.
pub fn effective_asset_formats<'a>(settings: &'a Settings, character_id: Option<&str>) -> &'a [FormatPair] {
    match character(settings, character_id) {
        Some(c) if c.use_character_asset_formats => &c.asset_formats,
        _ => &settings.asset_formats,
    }
}

/// Asset format option id for a character, or the global id.
pub fn effective_asset_format_id<'a>(settings: &'a Settings, character_id: Option<&str>) -> &'a str {
    match character(settings, character_id) {
        Some(CharacterSettings {
            use_character_asset_formats: true,
            asset_format_id: Some(id),
            ..
        }) if !id.is_empty() => id,
        _ => &settings.asset_format_id,
    }
}

fn lore_entry_key(book: &str, uid: &str) -> String {
    format!("{book}::{uid}")
}

// ── Manager ─────────────────────────────────────────────────────────

/// Shared, optionally file-backed settings.
///
/// Every mutator persists to disk when a path is configured. Reads see the
/// stored settings with any [`EnvOverrides`] on top; overrides win over
/// values set through the mutators and are never saved.
pub struct SettingsManager {
    stored: RwLock<Settings>,
    overrides: RwLock<EnvOverrides>,
    path: Option<PathBuf>,
}

impl SettingsManager {
    /// In-memory settings, never persisted.
    pub fn new(settings: Settings) -> Self {
        Self {
            stored: RwLock::new(settings),
            overrides: RwLock::new(EnvOverrides::default()),
            path: None,
        }
    }

    /// Load settings from a JSON file; a missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let settings = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                ConfigError::ParseError(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Settings file not found, using defaults");
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            stored: RwLock::new(settings),
            overrides: RwLock::new(EnvOverrides::default()),
            path: Some(path),
        })
    }

    /// Current settings, overrides applied.
    pub async fn snapshot(&self) -> Settings {
        let mut settings = self.stored.read().await.clone();
        self.overrides.read().await.apply(&mut settings);
        settings
    }

    pub async fn is_enabled(&self) -> bool {
        if let Some(enabled) = self.overrides.read().await.enabled {
            return enabled;
        }
        self.stored.read().await.enabled
    }

    /// Read `AUXMERGE_*` overrides from the environment.
    pub async fn apply_env(&self) -> Result<(), ConfigError> {
        let overrides = EnvOverrides::from_env()?;
        self.set_overrides(overrides).await;
        Ok(())
    }

    pub async fn set_overrides(&self, overrides: EnvOverrides) {
        if !overrides.is_empty() {
            info!(overrides = ?overrides, "Applying environment overrides");
        }
        *self.overrides.write().await = overrides;
    }

    /// Write settings to the backing file, if any.
    pub async fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let settings = self.stored.read().await;
            serde_json::to_string_pretty(&*settings)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Apply a mutation and persist.
    pub async fn update<F>(&self, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        {
            let mut settings = self.stored.write().await;
            mutate(&mut settings);
        }
        self.save().await
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<(), ConfigError> {
        self.update(|s| s.enabled = enabled).await
    }

    pub async fn set_connection_profile(&self, profile_id: Option<String>) -> Result<(), ConfigError> {
        self.update(|s| s.connection_profile_id = profile_id).await
    }

    pub async fn set_prompt_template(&self, template: impl Into<String>) -> Result<(), ConfigError> {
        let template = template.into();
        self.update(|s| s.prompt_template = template).await
    }

    pub async fn reset_prompt_template(&self) -> Result<(), ConfigError> {
        self.update(|s| s.prompt_template = DEFAULT_PROMPT_TEMPLATE.to_string())
            .await
    }

    pub async fn set_asset_format_id(&self, id: impl Into<String>) -> Result<(), ConfigError> {
        let id = id.into();
        self.update(|s| s.asset_format_id = id).await
    }

    pub async fn set_lore_keyword(&self, keyword: impl Into<String>) -> Result<(), ConfigError> {
        let keyword = keyword.into();
        self.update(|s| s.lore_keyword = keyword).await
    }

    pub async fn set_history_turns(&self, turns: usize) -> Result<(), ConfigError> {
        self.update(|s| s.history_turns = turns.min(MAX_HISTORY_TURNS))
            .await
    }

    pub async fn add_status_format(&self, format: FormatPair) -> Result<(), ConfigError> {
        self.update(|s| s.status_formats.push(format)).await
    }

    pub async fn remove_status_format(&self, index: usize) -> Result<(), ConfigError> {
        self.update(|s| remove_at(&mut s.status_formats, index)).await
    }

    pub async fn add_asset_format(&self, format: FormatPair) -> Result<(), ConfigError> {
        self.update(|s| s.asset_formats.push(format)).await
    }

    pub async fn remove_asset_format(&self, index: usize) -> Result<(), ConfigError> {
        self.update(|s| remove_at(&mut s.asset_formats, index)).await
    }

    // ── Per-character overrides ─────────────────────────────────────

    /// Mutate a character's overrides, creating defaults on first use.
    pub async fn update_character<F>(&self, character_id: &str, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut CharacterSettings),
    {
        self.update(|s| {
            mutate(
                s.character_settings
                    .entry(character_id.to_string())
                    .or_default(),
            )
        })
        .await
    }

    pub async fn character_settings(&self, character_id: &str) -> Option<CharacterSettings> {
        self.stored
            .read()
            .await
            .character_settings
            .get(character_id)
            .cloned()
    }

    pub async fn set_character_use_status_formats(&self, character_id: &str, enabled: bool) -> Result<(), ConfigError> {
        self.update_character(character_id, |c| c.use_character_status_formats = enabled)
            .await
    }

    pub async fn set_character_use_asset_formats(&self, character_id: &str, enabled: bool) -> Result<(), ConfigError> {
        self.update_character(character_id, |c| c.use_character_asset_formats = enabled)
            .await
    }

    pub async fn add_character_status_format(&self, character_id: &str, format: FormatPair) -> Result<(), ConfigError> {
        self.update_character(character_id, |c| c.status_formats.push(format))
            .await
    }

    pub async fn remove_character_status_format(&self, character_id: &str, index: usize) -> Result<(), ConfigError> {
        self.update_character(character_id, |c| remove_at(&mut c.status_formats, index))
            .await
    }

    pub async fn add_character_asset_format(&self, character_id: &str, format: FormatPair) -> Result<(), ConfigError> {
        self.update_character(character_id, |c| c.asset_formats.push(format))
            .await
    }

    pub async fn remove_character_asset_format(&self, character_id: &str, index: usize) -> Result<(), ConfigError> {
        self.update_character(character_id, |c| remove_at(&mut c.asset_formats, index))
            .await
    }

    pub async fn set_character_asset_format_id(&self, character_id: &str, id: impl Into<String>) -> Result<(), ConfigError> {
        let id = id.into();
        self.update_character(character_id, |c| c.asset_format_id = Some(id))
            .await
    }

    /// Selected lore entry keys (`book::uid`) for a character.
    pub async fn selected_lore_entries(&self, character_id: &str) -> Vec<String> {
        self.character_settings(character_id)
            .await
            .map(|c| c.selected_lore_entries)
            .unwrap_or_default()
    }

    pub async fn select_lore_entry(&self, character_id: &str, book: &str, uid: &str) -> Result<(), ConfigError> {
        let key = lore_entry_key(book, uid);
        if self.is_lore_entry_selected(character_id, book, uid).await {
            return Ok(());
        }
        self.update_character(character_id, |c| c.selected_lore_entries.push(key))
            .await
    }

    pub async fn deselect_lore_entry(&self, character_id: &str, book: &str, uid: &str) -> Result<(), ConfigError> {
        let key = lore_entry_key(book, uid);
        if !self.is_lore_entry_selected(character_id, book, uid).await {
            return Ok(());
        }
        self.update_character(character_id, |c| {
            c.selected_lore_entries.retain(|k| *k != key)
        })
        .await
    }

    pub async fn is_lore_entry_selected(&self, character_id: &str, book: &str, uid: &str) -> bool {
        let key = lore_entry_key(book, uid);
        self.stored
            .read()
            .await
            .character_settings
            .get(character_id)
            .is_some_and(|c| c.selected_lore_entries.contains(&key))
    }

    pub async fn clear_selected_lore_entries(&self, character_id: &str) -> Result<(), ConfigError> {
        if self.character_settings(character_id).await.is_none() {
            return Ok(());
        }
        self.update_character(character_id, |c| c.selected_lore_entries.clear())
            .await
    }
}

fn remove_at<T>(items: &mut Vec<T>, index: usize) {
    if index < items.len() {
        items.remove(index);
    }
}
