//! Query Preprocessor: normalization, language classification, tokenization,
//! stop-word filtering, and critical-phrase extraction for the BM25 leg.
//!
//! CJK handling is the part most likely to rot silently: a naive
//! reimplementation of the bigram/critical-phrase heuristics quietly
//! degrades recall on CJK content, so every rule here is covered by a
//! literal-input test below rather than inferred from the algorithm alone.

use crate::models::{Language, ProcessedQuery};

/// Fixed CJK stop-word list (particles, copulas, and punctuation-adjacent
/// function words common enough to be pure noise in a keyword index).
const CJK_STOP_WORDS: &[&str] = &[
    "の", "に", "は", "を", "た", "が", "で", "て", "と", "し", "れ", "さ", "ある", "いる", "も",
    "する", "から", "な", "こと", "として", "い", "や", "です", "ます", "です", "的", "了", "和",
    "是", "在", "都", "而", "及", "与", "著", "或", "一個", "沒有", "我們", "你們", "妳們", "他們",
    "她們", "是否", "的話",
];

/// Unicode normalization + classification + tokenization pipeline.
pub fn preprocess(raw: &str) -> ProcessedQuery {
    let original = raw.to_string();

    let normalized = normalize_unicode(raw);
    let normalized = collapse_whitespace(&normalized);

    let (cjk_ratio, latin_ratio) = char_class_ratios(&normalized);
    let language = classify_language(cjk_ratio, latin_ratio);

    let cjk_text: String = normalized.chars().filter(|c| is_cjk(*c)).collect();
    let alpha_numeric: String = normalized
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    let terms = tokenize(&normalized, language);

    let critical_phrases = extract_critical_phrases(&normalized);

    ProcessedQuery {
        original,
        normalized,
        terms,
        cjk_text,
        alpha_numeric,
        language,
        critical_phrases,
    }
}

/// Applies the same unicode normalization and whitespace collapsing used for
/// queries to indexed content, populating [`crate::models::DocumentRecord::content_normalized`].
pub fn normalize_content(raw: &str) -> String {
    collapse_whitespace(&normalize_unicode(raw))
}

/// Full-width ASCII (`！-～`, U+FF01–U+FF5E) → ASCII (`!`-`~`), and katakana
/// (U+30A1–U+30F6) → hiragana (U+3041–U+3096) by the fixed 0x60 code-point offset.
fn normalize_unicode(s: &str) -> String {
    s.chars()
        .map(|c| {
            let cp = c as u32;
            if (0xFF01..=0xFF5E).contains(&cp) {
                char::from_u32(cp - 0xFEE0).unwrap_or(c)
            } else if cp == 0x3000 {
                ' '
            } else if (0x30A1..=0x30F6).contains(&cp) {
                char::from_u32(cp - 0x60).unwrap_or(c)
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn is_cjk(c: char) -> bool {
    let cp = c as u32;
    (0x3040..=0x30FF).contains(&cp) // hiragana + katakana
        || (0x4E00..=0x9FFF).contains(&cp) // CJK unified ideographs
        || (0x3400..=0x4DBF).contains(&cp) // CJK extension A
        || (0xAC00..=0xD7A3).contains(&cp) // hangul syllables
}

/// Returns `(cjk_ratio, latin_ratio)` over non-whitespace characters.
fn char_class_ratios(s: &str) -> (f64, f64) {
    let mut total = 0usize;
    let mut cjk = 0usize;
    let mut latin = 0usize;

    for c in s.chars() {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        if is_cjk(c) {
            cjk += 1;
        } else if c.is_ascii_alphanumeric() {
            latin += 1;
        }
    }

    if total == 0 {
        return (0.0, 0.0);
    }
    (cjk as f64 / total as f64, latin as f64 / total as f64)
}

fn classify_language(cjk_ratio: f64, latin_ratio: f64) -> Language {
    if cjk_ratio > 0.5 {
        Language::Cjk
    } else if latin_ratio > 0.7 {
        Language::Latin
    } else if cjk_ratio == 0.0 && latin_ratio == 0.0 {
        Language::Unknown
    } else {
        Language::Mixed
    }
}

/// Whitespace tokenization for latin spans; for CJK spans, also emits
/// character bigrams for runs longer than two characters.
fn tokenize(normalized: &str, _language: Language) -> Vec<String> {
    let mut terms = Vec::new();

    for word in normalized.split_whitespace() {
        terms.push(word.to_string());

        let cjk_run: Vec<char> = word.chars().filter(|c| is_cjk(*c)).collect();
        if cjk_run.len() > 2 {
            for pair in cjk_run.windows(2) {
                terms.push(pair.iter().collect());
            }
        }
    }

    terms
        .into_iter()
        .filter(|t| !CJK_STOP_WORDS.contains(&t.as_str()))
        .filter(|t| t.chars().count() > 1)
        .collect()
}

pub(crate) const CURRENCY_UNIT_MARKERS: &[char] = &['円', '%', '$', '¥', '€', '£', '%'];

/// Digit (ASCII or full-width, the latter already folded to ASCII by
/// [`normalize_unicode`]) immediately followed by a currency/unit marker,
/// after space removal. Deduplicated and length-bounded to 3–16 bytes (not
/// code points: a two-code-point phrase like `0円` is already 4 bytes since
/// `円` is a 3-byte UTF-8 character, and the spec's own examples size the
/// bound this way).
fn extract_critical_phrases(normalized: &str) -> Vec<String> {
    let no_space: String = normalized.chars().filter(|c| !c.is_whitespace()).collect();
    let chars: Vec<char> = no_space.chars().collect();

    let mut phrases = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit() {
            let start = i;
            let mut j = i;
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            if j < chars.len() && CURRENCY_UNIT_MARKERS.contains(&chars[j]) {
                j += 1;
                let phrase: String = chars[start..j].iter().collect();
                let len = phrase.len();
                if (3..=16).contains(&len) {
                    phrases.push(phrase);
                }
            }
            i = j.max(start + 1);
        } else {
            i += 1;
        }
    }

    phrases.sort();
    phrases.dedup();
    phrases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fullwidth_digits_normalize_to_ascii_equivalent_classification() {
        let ascii = preprocess("100yen");
        let fullwidth = preprocess("\u{FF11}\u{FF10}\u{FF10}yen");
        assert_eq!(ascii.language, fullwidth.language);
        assert_eq!(ascii.normalized, fullwidth.normalized);
    }

    #[test]
    fn katakana_folds_to_hiragana() {
        let out = preprocess("\u{30AB}\u{30BF}\u{30AB}\u{30CA}"); // カタカナ
        assert_eq!(out.normalized, "\u{304B}\u{305F}\u{304B}\u{306A}"); // かたかな
    }

    #[test]
    fn pure_cjk_query_classified_cjk() {
        let out = preprocess("東京オフィス案内");
        assert_eq!(out.language, Language::Cjk);
    }

    #[test]
    fn pure_latin_query_classified_latin() {
        let out = preprocess("tokyo office guide");
        assert_eq!(out.language, Language::Latin);
    }

    #[test]
    fn mixed_query_classified_mixed() {
        let out = preprocess("0円チャージ API");
        assert_eq!(out.language, Language::Mixed);
    }

    #[test]
    fn cjk_bigrams_emitted_for_runs_over_two_chars() {
        let out = preprocess("東京都庁");
        assert!(out.terms.contains(&"東京".to_string()));
        assert!(out.terms.contains(&"京都".to_string()));
        assert!(out.terms.contains(&"都庁".to_string()));
    }

    #[test]
    fn short_cjk_run_gets_no_bigrams() {
        let out = preprocess("東京");
        assert!(!out.terms.iter().any(|t| t.chars().count() == 2 && *t != "東京"));
    }

    #[test]
    fn stop_words_and_single_chars_filtered() {
        let out = preprocess("これはテストです");
        assert!(!out.terms.iter().any(|t| t == "は" || t == "です"));
    }

    #[test]
    fn critical_phrase_extracted_for_digit_currency() {
        let out = preprocess("0円チャージ API");
        assert!(out.critical_phrases.contains(&"0円".to_string()));
    }

    #[test]
    fn critical_phrase_extracted_for_percent() {
        let out = preprocess("boost 100% please");
        assert!(out.critical_phrases.contains(&"100%".to_string()));
    }

    #[test]
    fn critical_phrases_are_deduplicated() {
        let out = preprocess("100% then 100% again");
        assert_eq!(
            out.critical_phrases.iter().filter(|p| *p == "100%").count(),
            1
        );
    }

    #[test]
    fn no_critical_phrase_without_marker() {
        let out = preprocess("just the number 100 alone");
        assert!(out.critical_phrases.is_empty());
    }
}
