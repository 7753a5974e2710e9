//! URL Detector: extracts HTTP(S) tokens from a query for the exact-match fast path.

use regex::Regex;
use std::sync::OnceLock;

fn url_re() -> &'static Regex {
    static URL_RE: OnceLock<Regex> = OnceLock::new();
    URL_RE.get_or_init(|| Regex::new(r"(?i)https?://\S+").unwrap())
}

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '"', '\''];
const WRAPPING_PAIRS: &[(char, char)] = &[('(', ')'), ('[', ']'), ('{', '}')];

/// Scans `query` for `https?://\S+` matches, trims surrounding punctuation and
/// brackets, re-validates the scheme survived trimming, and deduplicates
/// while preserving first-seen order.
pub fn detect_urls(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for m in url_re().find_iter(query.trim()) {
        let mut candidate = m.as_str();

        loop {
            let before = candidate;
            candidate = candidate.trim_end_matches(TRAILING_PUNCTUATION);
            for (open, close) in WRAPPING_PAIRS {
                if candidate.ends_with(*close) && !candidate.contains(*open) {
                    candidate = &candidate[..candidate.len() - close.len_utf8()];
                }
            }
            if candidate == before {
                break;
            }
        }

        let lower = candidate.to_ascii_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            continue;
        }

        if seen.insert(candidate.to_string()) {
            out.push(candidate.to_string());
        }
    }

    out
}
