//! Duplicate detection: URL canonicalization and per-owner grouping.

use std::collections::{HashMap, HashSet};
use url::Url;

/// Query parameters that only carry campaign or click tracking.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "gbraid", "wbraid", "msclkid", "yclid", "twclid", "igshid",
    "mc_cid", "mc_eid", "_ga", "_gl", "_hsenc", "_hsmi", "mkt_tok", "ref_src", "spm",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonical form used to compare bookmarked URLs.
///
/// Lowercases the URL, drops tracking parameters and the fragment. Strings
/// that do not parse as URLs are only lowercased and stripped of the fragment.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        let without_fragment = trimmed.split('#').next().unwrap_or_default();
        return without_fragment.to_lowercase();
    };

    url.set_fragment(None);
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    url.to_string().to_lowercase()
}

/// One bookmark's comparison keys.
#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub bookmark_id: String,
    pub owner_id: String,
    pub normalized_url: String,
    pub content_hash: Option<String>,
}

/// Ids of every bookmark that shares a normalized URL or a content hash with
/// another bookmark of the same owner. Every member of a group is returned.
pub fn find_duplicates(candidates: &[DuplicateCandidate]) -> HashSet<String> {
    let mut by_url: HashMap<(&str, &str), Vec<&str>> = HashMap::new();
    let mut by_hash: HashMap<(&str, &str), Vec<&str>> = HashMap::new();

    for c in candidates {
        by_url
            .entry((c.owner_id.as_str(), c.normalized_url.as_str()))
            .or_default()
            .push(c.bookmark_id.as_str());
        if let Some(hash) = &c.content_hash {
            by_hash
                .entry((c.owner_id.as_str(), hash.as_str()))
                .or_default()
                .push(c.bookmark_id.as_str());
        }
    }

    by_url
        .into_values()
        .chain(by_hash.into_values())
        .filter(|group| group.len() > 1)
        .flatten()
        .map(str::to_string)
        .collect()
}
