//! Marker parser: decodes raw generator output into an [`InstructionSet`].
//!
//! Recognized blocks (tags are ASCII case-insensitive, bodies may span lines
//! and are matched up to the nearest closing tag):
//!
//! ```text
//! [PREPEND]<text>[/PREPEND]
//! [APPEND]<text>[/APPEND]
//! [INSERT:<N>]<text>[/INSERT]
//! ```
//!
//! Each block kind is scanned independently over the whole input. Text
//! outside any block is ignored unless no block is recognized at all, in
//! which case the whole response becomes a single prepend block.

use tracing::debug;

use super::model::{Insert, InstructionSet};

const PREPEND_OPEN: &str = "[prepend]";
const PREPEND_CLOSE: &str = "[/prepend]";
const APPEND_OPEN: &str = "[append]";
const APPEND_CLOSE: &str = "[/append]";
const INSERT_OPEN: &str = "[insert:";
const INSERT_CLOSE: &str = "[/insert]";

/// Parse raw secondary output.
///
/// Returns `None` only for empty input. Whitespace-only blocks are dropped,
/// so a response made solely of such blocks yields an empty set.
pub fn parse(raw: &str) -> Option<InstructionSet> {
    if raw.is_empty() {
        return None;
    }

    // Some generators over-escape newlines.
    let normalized = raw.replace("\\n", "\n");
    // ASCII folding keeps byte offsets identical to `normalized`.
    let folded = normalized.to_ascii_lowercase();

    let prepend_blocks = scan_delimited(&normalized, &folded, PREPEND_OPEN, PREPEND_CLOSE);
    let append_blocks = scan_delimited(&normalized, &folded, APPEND_OPEN, APPEND_CLOSE);
    let insert_blocks = scan_inserts(&normalized, &folded);

    let recognized = prepend_blocks.len() + append_blocks.len() + insert_blocks.len();

    let mut set = InstructionSet {
        prepend: prepend_blocks.into_iter().filter_map(non_empty).collect(),
        append: append_blocks.into_iter().filter_map(non_empty).collect(),
        inserts: insert_blocks
            .into_iter()
            .filter_map(|(digits, body)| {
                non_empty(body).map(|content| Insert {
                    // Only overflow can fail here; an oversized index clamps
                    // to the end of the message anyway.
                    position: digits.parse().unwrap_or(usize::MAX),
                    content,
                })
            })
            .collect(),
    };

    if recognized == 0 {
        let trimmed = normalized.trim();
        if !trimmed.is_empty() {
            debug!("No position markers found, treating entire response as prepend");
            set.prepend.push(trimmed.to_string());
        }
    }

    set.sort_inserts();

    debug!(
        prepend = set.prepend.len(),
        append = set.append.len(),
        inserts = set.inserts.len(),
        had_markers = recognized > 0,
        "Parsed secondary output"
    );

    Some(set)
}

fn non_empty(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Collect the bodies of every `open … close` pair, leftmost first.
fn scan_delimited<'a>(text: &'a str, folded: &str, open: &str, close: &str) -> Vec<&'a str> {
    let mut bodies = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = folded[cursor..].find(open) {
        let body_start = cursor + rel + open.len();
        // An opening tag without a closing tag after it means no later
        // opening tag can be closed either.
        let Some(close_rel) = folded[body_start..].find(close) else {
            break;
        };
        let body_end = body_start + close_rel;
        bodies.push(&text[body_start..body_end]);
        cursor = body_end + close.len();
    }

    bodies
}

/// Collect `(digits, body)` for every `[INSERT:<digits>] … [/INSERT]` pair.
fn scan_inserts<'a>(text: &'a str, folded: &str) -> Vec<(&'a str, &'a str)> {
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = folded[cursor..].find(INSERT_OPEN) {
        let tag_start = cursor + rel;
        let digits_start = tag_start + INSERT_OPEN.len();
        let digits_len = folded[digits_start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        let digits_end = digits_start + digits_len;

        if digits_len == 0 || !folded[digits_end..].starts_with(']') {
            // Malformed tag, resume just past its '['.
            cursor = tag_start + 1;
            continue;
        }

        let body_start = digits_end + 1;
        let Some(close_rel) = folded[body_start..].find(INSERT_CLOSE) else {
            break;
        };
        let body_end = body_start + close_rel;
        blocks.push((&text[digits_start..digits_end], &text[body_start..body_end]));
        cursor = body_end + INSERT_CLOSE.len();
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_absent() {
        assert!(parse("").is_none());
    }

    #[test]
    fn plain_text_becomes_single_prepend() {
        let set = parse("plain text").unwrap();
        assert_eq!(set.prepend, vec!["plain text".to_string()]);
        assert!(set.append.is_empty());
        assert!(set.inserts.is_empty());
    }

    #[test]
    fn fallback_trims_whole_response() {
        let set = parse("  \n<status>hp: 10</status>\n  ").unwrap();
        assert_eq!(set.prepend, vec!["<status>hp: 10</status>".to_string()]);
    }

    #[test]
    fn whitespace_only_response_yields_empty_set() {
        let set = parse("   \n ").unwrap();
        assert!(!set.has_content());
    }

    #[test]
    fn whitespace_only_blocks_are_dropped_without_fallback() {
        let set = parse("[PREPEND]   [/PREPEND]").unwrap();
        assert!(!set.has_content());

        let set = parse("[PREPEND] \n [/PREPEND] [APPEND][/APPEND] [INSERT:2]  [/INSERT]").unwrap();
        assert!(!set.has_content());
    }

    #[test]
    fn parses_all_three_kinds() {
        let raw = "[PREPEND]<status>hp: 100</status>[/PREPEND]\n\
                   [INSERT:1]%%img:forest.png%%[/INSERT]\n\
                   [APPEND]%%img:smile.png%%[/APPEND]";
        let set = parse(raw).unwrap();
        assert_eq!(set.prepend, vec!["<status>hp: 100</status>".to_string()]);
        assert_eq!(set.append, vec!["%%img:smile.png%%".to_string()]);
        assert_eq!(set.inserts, vec![Insert::new(1, "%%img:forest.png%%")]);
    }

    #[test]
    fn tags_are_case_insensitive() {
        let set = parse("[prepend]a[/PREPEND][Append]b[/aPPend][insert:2]c[/Insert]").unwrap();
        assert_eq!(set.prepend, vec!["a".to_string()]);
        assert_eq!(set.append, vec!["b".to_string()]);
        assert_eq!(set.inserts, vec![Insert::new(2, "c")]);
    }

    #[test]
    fn bodies_are_non_greedy_and_multiline() {
        let raw = "[APPEND]\nfirst\nline two\n[/APPEND] noise [APPEND]second[/APPEND]";
        let set = parse(raw).unwrap();
        assert_eq!(
            set.append,
            vec!["first\nline two".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn escaped_newlines_are_unescaped() {
        let set = parse(r"[PREPEND]<status>\nhp: 1\n</status>[/PREPEND]").unwrap();
        assert_eq!(set.prepend, vec!["<status>\nhp: 1\n</status>".to_string()]);
    }

    #[test]
    fn text_outside_blocks_is_ignored() {
        let set = parse("Sure! Here you go:\n[APPEND]X[/APPEND]\nHope that helps").unwrap();
        assert!(set.prepend.is_empty());
        assert_eq!(set.append, vec!["X".to_string()]);
    }

    #[test]
    fn inserts_sorted_descending_and_stable() {
        let raw = "[INSERT:1]A[/INSERT][INSERT:3]C[/INSERT][INSERT:1]B[/INSERT][INSERT:0]Z[/INSERT]";
        let set = parse(raw).unwrap();
        let order: Vec<(usize, &str)> = set
            .inserts
            .iter()
            .map(|i| (i.position, i.content.as_str()))
            .collect();
        assert_eq!(order, vec![(3, "C"), (1, "A"), (1, "B"), (0, "Z")]);
    }

    #[test]
    fn malformed_insert_tags_are_skipped() {
        let raw = "[INSERT:x]bad[/INSERT][INSERT:]bad[/INSERT][INSERT:4]good[/INSERT]";
        let set = parse(raw).unwrap();
        assert_eq!(set.inserts.len(), 1);
        assert_eq!(set.inserts[0].position, 4);
        assert_eq!(set.inserts[0].content, "good");
    }

    #[test]
    fn malformed_insert_only_response_falls_back() {
        let set = parse("[INSERT:abc]hello[/INSERT]").unwrap();
        assert_eq!(set.prepend, vec!["[INSERT:abc]hello[/INSERT]".to_string()]);
    }

    #[test]
    fn unclosed_block_is_not_recognized() {
        let set = parse("[PREPEND]dangling").unwrap();
        assert_eq!(set.prepend, vec!["[PREPEND]dangling".to_string()]);
    }

    #[test]
    fn oversized_insert_index_saturates() {
        let set = parse("[INSERT:99999999999999999999999]far[/INSERT]").unwrap();
        assert_eq!(set.inserts[0].position, usize::MAX);
    }

    #[test]
    fn kinds_are_scanned_independently() {
        let set = parse("[PREPEND]a [APPEND]b[/APPEND] c[/PREPEND]").unwrap();
        assert_eq!(set.prepend, vec!["a [APPEND]b[/APPEND] c".to_string()]);
        assert_eq!(set.append, vec!["b".to_string()]);
    }

    #[test]
    fn non_ascii_content_is_preserved() {
        let set = parse("[PREPEND]상태: 정상 İstanbul[/PREPEND]").unwrap();
        assert_eq!(set.prepend, vec!["상태: 정상 İstanbul".to_string()]);
    }
}
