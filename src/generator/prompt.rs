//! Prompt assembly for the auxiliary generator.

use crate::config::AssetFormatOption;
use crate::transcript::HistoryTurn;

/// Characters of each earlier primary message shown in the history.
const HISTORY_EXCERPT_CHARS: usize = 200;

const NO_HISTORY: &str = "(No previous outputs)";

/// Values substituted into the prompt template.
#[derive(Debug, Clone)]
pub struct PromptValues<'a> {
    pub world_info: &'a str,
    pub last_message: &'a str,
    pub asset_format: &'a AssetFormatOption,
    pub asset_count: u32,
    pub history: &'a [HistoryTurn],
}

/// Render earlier exchanges, oldest first.
pub fn format_history(history: &[HistoryTurn]) -> String {
    if history.is_empty() {
        return NO_HISTORY.to_string();
    }
    history
        .iter()
        .enumerate()
        .map(|(i, turn)| {
            let excerpt: String = turn.main.chars().take(HISTORY_EXCERPT_CHARS).collect();
            format!(
                "[Turn {}]\nMain: {excerpt}...\nAux Output: {}",
                i + 1,
                turn.raw_output
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fill every `{{placeholder}}` occurrence in `template`.
///
/// Substitution runs in a fixed order, so text inserted by an earlier
/// placeholder is still subject to later ones.
pub fn build_prompt(template: &str, values: &PromptValues<'_>) -> String {
    let asset_format = format!(
        "{}filename.ext{}",
        values.asset_format.start, values.asset_format.end
    );
    let asset_count = values.asset_count.to_string();
    let history = format_history(values.history);

    [
        ("{{worldInfo}}", values.world_info),
        ("{{lastMessage}}", values.last_message),
        ("{{assetFormat}}", asset_format.as_str()),
        ("{{assetExample}}", values.asset_format.example),
        ("{{assetCount}}", asset_count.as_str()),
        ("{{auxHistory}}", history.as_str()),
    ]
    .into_iter()
    .fold(template.to_string(), |prompt, (placeholder, value)| {
        prompt.replace(placeholder, value)
    })
}
