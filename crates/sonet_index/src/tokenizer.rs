//! Tokenization: Unicode word segmentation, casefold, stop-word removal,
//! optional light stemming.

use unicode_segmentation::UnicodeSegmentation;

use crate::config::IndexConfig;

/// One indexable token with its word position in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub term: String,
    pub position: u32,
}

/// Tokenize message content. Positions count all words before stop-word
/// removal, so phrase distances survive filtering.
pub fn tokenize(text: &str, config: &IndexConfig) -> Vec<Token> {
    text.unicode_words()
        .enumerate()
        .filter_map(|(pos, word)| {
            let folded = word.to_lowercase();
            if config.stop_words.contains(&folded) {
                return None;
            }
            let term = if config.enable_stemming { stem(&folded) } else { folded };
            Some(Token { term, position: pos as u32 })
        })
        .collect()
}

/// Query-side tokenization: same pipeline, deduplicated terms.
pub fn tokenize_query(query: &str, config: &IndexConfig) -> Vec<String> {
    let mut terms: Vec<String> = tokenize(query, config).into_iter().map(|t| t.term).collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Light English suffix stripping. No dictionary; a stem shorter than
/// three characters is left alone.
pub fn stem(word: &str) -> String {
    const SUFFIXES: &[&str] = &["ingly", "edly", "ing", "ed", "ies", "es", "ly", "s"];
    for suffix in SUFFIXES {
        if let Some(stripped) = word.strip_suffix(suffix) {
            if stripped.chars().count() >= 3 {
                if *suffix == "ies" {
                    return format!("{stripped}y");
                }
                return stripped.to_string();
            }
        }
    }
    word.to_string()
}
