//! Text normalization for indexing and duplicate detection.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static HORIZONTAL_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\S\n]+").expect("valid regex"));

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Clean extracted text without dropping words.
///
/// - `\r\n` and lone `\r` become `\n`
/// - runs of non-newline whitespace become a single space
/// - every line is trimmed
/// - more than two consecutive newlines become two
/// - the whole document is trimmed
///
/// Whitespace-only input cleans to an empty string. Cleaning clean text is a no-op.
pub fn clean_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let collapsed = HORIZONTAL_WHITESPACE.replace_all(&unified, " ");
    let trimmed_lines = collapsed
        .split('\n')
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n");
    EXCESS_NEWLINES
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}

/// Stable digest of cleaned text, used to match mirrored or reposted pages.
///
/// Case and punctuation are ignored so cosmetic differences between copies of
/// the same article still collide. Returns `None` when there is no textual
/// content, so empty pages never match each other.
pub fn content_hash(cleaned: &str) -> Option<String> {
    let normalized = cleaned
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if normalized.is_empty() {
        return None;
    }

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}
