//! Lore (world info) books.
//!
//! Books are keyword-tagged reference entries. The generator pulls in the
//! entries tagged with the configured keyword; [`tag_entries`] adds that
//! keyword to entries the user picked.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SettingsManager;
use crate::error::{ConfigError, LoreError};

/// A single lore entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoreEntry {
    /// Primary keys.
    pub key: Vec<String>,
    /// Secondary keys.
    pub keysecondary: Vec<String>,
    pub content: String,
    pub comment: String,
    pub disable: bool,
}

impl LoreEntry {
    fn has_keyword(&self, keyword_lower: &str) -> bool {
        self.key
            .iter()
            .chain(&self.keysecondary)
            .any(|k| k.to_lowercase().contains(keyword_lower))
    }
}

/// A lore book, entries keyed by uid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoreBook {
    #[serde(default)]
    pub entries: BTreeMap<u32, LoreEntry>,
}

/// An entry flattened with the book it came from, for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEntry {
    pub book: String,
    pub uid: u32,
    pub entry: LoreEntry,
}

impl BoundEntry {
    /// Selection key, `book::uid`.
    pub fn selection_key(&self) -> String {
        format!("{}::{}", self.book, self.uid)
    }
}

/// Where lore books come from.
#[async_trait]
pub trait LoreSource: Send + Sync {
    /// Books bound to the active character/chat.
    async fn bound_books(&self) -> Vec<String>;

    async fn load_book(&self, name: &str) -> Result<LoreBook, LoreError>;

    async fn save_book(&self, name: &str, book: &LoreBook) -> Result<(), LoreError>;
}

/// Expands host macros (e.g. `{{char}}`) inside entry content.
pub trait MacroExpander: Send + Sync {
    fn expand(&self, text: &str) -> String;
}

/// Leaves content untouched.
pub struct NoMacros;

impl MacroExpander for NoMacros {
    fn expand(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Replaces `{{name}}` with fixed values.
#[derive(Debug, Clone, Default)]
pub struct StaticMacros {
    values: HashMap<String, String>,
}

impl StaticMacros {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl MacroExpander for StaticMacros {
    fn expand(&self, text: &str) -> String {
        self.values
            .iter()
            .fold(text.to_string(), |acc, (name, value)| {
                acc.replace(&format!("{{{{{name}}}}}"), value)
            })
    }
}

/// Books stored as `<dir>/<book>.json`.
pub struct FileLore {
    dir: PathBuf,
    bound: Vec<String>,
}

impl FileLore {
    pub fn new(dir: impl Into<PathBuf>, bound: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            bound,
        }
    }

    fn book_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl LoreSource for FileLore {
    async fn bound_books(&self) -> Vec<String> {
        self.bound.clone()
    }

    async fn load_book(&self, name: &str) -> Result<LoreBook, LoreError> {
        let raw = match tokio::fs::read_to_string(self.book_path(name)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoreError::BookNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save_book(&self, name: &str, book: &LoreBook) -> Result<(), LoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(book)?;
        tokio::fs::write(self.book_path(name), json).await?;
        Ok(())
    }
}

/// Lore text for the generator prompt.
///
/// Collects every entry in the bound books whose primary or secondary keys
/// contain `keyword` (case-insensitive) and whose content is non-empty,
/// expands macros, and joins them with a blank line. Any failure yields
/// an empty string.
pub async fn retrieve(source: &dyn LoreSource, keyword: &str, macros: &dyn MacroExpander) -> String {
    if keyword.is_empty() {
        return String::new();
    }
    let books = source.bound_books().await;
    if books.is_empty() {
        debug!("No bound lore books");
        return String::new();
    }

    let keyword_lower = keyword.to_lowercase();
    let mut sections = Vec::new();
    for name in &books {
        let book = match source.load_book(name).await {
            Ok(book) => book,
            Err(e) => {
                warn!(book = %name, error = %e, "Failed to load lore book");
                continue;
            }
        };
        sections.extend(
            book.entries
                .values()
                .filter(|entry| !entry.content.is_empty() && entry.has_keyword(&keyword_lower))
                .map(|entry| macros.expand(&entry.content)),
        );
    }

    info!(
        entries = sections.len(),
        books = books.len(),
        keyword = %keyword,
        "Collected lore entries"
    );
    sections.join("\n\n")
}

/// Every entry in the bound books, for selection.
pub async fn bound_entries(source: &dyn LoreSource) -> Vec<BoundEntry> {
    let mut entries = Vec::new();
    for name in source.bound_books().await {
        match source.load_book(&name).await {
            Ok(book) => entries.extend(book.entries.into_iter().map(|(uid, entry)| BoundEntry {
                book: name.clone(),
                uid,
                entry,
            })),
            Err(e) => warn!(book = %name, error = %e, "Failed to load lore book"),
        }
    }
    entries
}

/// Outcome of [`tag_entries`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagSummary {
    pub success: usize,
    pub failed: usize,
}

/// Add `keyword` to each selected entry's keys and optionally disable it.
///
/// `selected` holds `book::uid` keys; malformed keys are skipped without
/// being counted. Books are only written when an entry actually changed.
pub async fn tag_entries(
    source: &dyn LoreSource,
    selected: &[String],
    keyword: &str,
    disable: bool,
) -> TagSummary {
    let mut summary = TagSummary::default();
    for key in selected {
        let Some((book, uid)) = key.split_once("::") else {
            continue;
        };
        if book.is_empty() || uid.is_empty() {
            continue;
        }
        match tag_entry(source, book, uid, keyword, disable).await {
            Ok(()) => summary.success += 1,
            Err(e) => {
                warn!(entry = %key, error = %e, "Failed to tag lore entry");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Tag the entries selected for `character_id` with the configured keyword.
///
/// The selection is left in place so it can be reviewed or cleared later.
pub async fn tag_selected(
    settings: &SettingsManager,
    source: &dyn LoreSource,
    character_id: Option<&str>,
    disable: bool,
) -> Result<TagSummary, ConfigError> {
    let character_id = character_id.ok_or_else(|| ConfigError::MissingRequired {
        key: "character_id".to_string(),
        hint: "Lore selection is stored per character".to_string(),
    })?;
    let keyword = settings.snapshot().await.lore_keyword;
    if keyword.is_empty() {
        return Err(ConfigError::MissingRequired {
            key: "lore_keyword".to_string(),
            hint: "Set a lore keyword before tagging entries".to_string(),
        });
    }

    let selected = settings.selected_lore_entries(character_id).await;
    if selected.is_empty() {
        debug!(character = %character_id, "No lore entries selected");
        return Ok(TagSummary::default());
    }
    let summary = tag_entries(source, &selected, &keyword, disable).await;
    info!(
        character = %character_id,
        keyword = %keyword,
        success = summary.success,
        failed = summary.failed,
        "Tagged selected lore entries"
    );
    Ok(summary)
}

async fn tag_entry(
    source: &dyn LoreSource,
    book_name: &str,
    uid: &str,
    keyword: &str,
    disable: bool,
) -> Result<(), LoreError> {
    let not_found = || LoreError::EntryNotFound {
        book: book_name.to_string(),
        uid: uid.to_string(),
    };
    let uid_num: u32 = uid.parse().map_err(|_| not_found())?;
    let mut book = source.load_book(book_name).await?;
    let entry = book.entries.get_mut(&uid_num).ok_or_else(not_found)?;

    let mut modified = false;
    if !keyword.is_empty()
        && !entry
            .key
            .iter()
            .any(|k| k.to_lowercase() == keyword.to_lowercase())
    {
        entry.key.push(keyword.to_string());
        modified = true;
    }
    if disable && !entry.disable {
        entry.disable = true;
        modified = true;
    }

    if modified {
        source.save_book(book_name, &book).await?;
        debug!(book = %book_name, uid = %uid, "Tagged lore entry");
    }
    Ok(())
}
