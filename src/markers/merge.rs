//! Merge engine: splices an [`InstructionSet`] into primary text.
//!
//! Pure and deterministic: the same primary text and instructions always
//! produce the same rendered text.

use std::sync::LazyLock;

use regex::Regex;

use super::model::InstructionSet;

/// Separator used between wrapped blocks and around the primary text.
const BLOCK_SEPARATOR: &str = "\n\n";

static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());

/// Split text into paragraphs, returning them with the separator to rejoin them.
///
/// Blank-line separated text splits on runs of two or more newlines. Text
/// without a blank line falls back to one paragraph per line.
pub fn split_paragraphs(text: &str) -> (Vec<&str>, &'static str) {
    let blocks: Vec<&str> = PARAGRAPH_BREAK.split(text).collect();
    if blocks.len() > 1 {
        return (blocks, BLOCK_SEPARATOR);
    }
    (text.split('\n').collect(), "\n")
}

/// Render primary text with secondary content spliced in.
pub fn merge(primary: &str, instructions: Option<&InstructionSet>) -> String {
    let Some(instructions) = instructions else {
        return primary.to_string();
    };

    let (mut paragraphs, separator) = split_paragraphs(primary);

    // Inserts are sorted highest position first, so each index still refers
    // to the original paragraph numbering when it is applied.
    for insert in &instructions.inserts {
        let index = insert.position.min(paragraphs.len());
        paragraphs.insert(index, insert.content.as_str());
    }

    let mut rendered = paragraphs.join(separator);

    if !instructions.prepend.is_empty() {
        rendered = format!(
            "{}{BLOCK_SEPARATOR}{rendered}",
            instructions.prepend.join(BLOCK_SEPARATOR)
        );
    }

    if !instructions.append.is_empty() {
        rendered.push_str(BLOCK_SEPARATOR);
        rendered.push_str(&instructions.append.join(BLOCK_SEPARATOR));
    }

    rendered
}
