// A small, self-contained multilingual tokenizer.
// - Lowercases and strips punctuation, preserving CJK code points
// - Splits on whitespace and on CJK unit boundaries (each CJK scalar is a term)
// - Drops ASCII terms shorter than 3 chars and English stop words; CJK terms
//   of any length are kept

use std::collections::HashSet;

use lazy_static::lazy_static;

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = {
        [
            "the", "and", "for", "are", "was", "were", "been", "being", "have", "has", "had",
            "does", "did", "doing", "will", "would", "could", "should", "may", "might", "must",
            "can", "this", "that", "these", "those", "with", "from", "into", "onto", "about",
            "after", "before", "between", "through", "during", "above", "below", "over", "under",
            "again", "then", "once", "here", "there", "when", "where", "why", "how", "all", "any",
            "both", "each", "few", "more", "most", "other", "some", "such", "only", "own", "same",
            "than", "too", "very", "just", "but", "not", "nor", "out", "off", "also", "its",
            "their", "them", "they", "what", "which", "who", "whom", "you", "your", "our", "his",
            "her", "she", "him",
        ]
        .into_iter()
        .collect()
    };
}

/// Minimum length for a non-CJK term to survive tokenization.
const MIN_ASCII_TERM_LEN: usize = 3;

/// True for code points tokenized one scalar at a time.
fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0xF900..=0xFAFF    // CJK Compatibility Ideographs
        | 0x3040..=0x309F    // Hiragana
        | 0x30A0..=0x30FF    // Katakana
        | 0xAC00..=0xD7AF    // Hangul Syllables
    )
}

/// Text to ordered term sequence.
///
/// The output order follows the input; duplicate terms are preserved so
/// callers can compute term frequencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tokenizer;

impl Tokenizer {
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut terms = Vec::new();
        let mut word = String::new();

        let mut flush = |word: &mut String, terms: &mut Vec<String>| {
            if word.len() >= MIN_ASCII_TERM_LEN && !STOP_WORDS.contains(word.as_str()) {
                terms.push(std::mem::take(word));
            } else {
                word.clear();
            }
        };

        for c in text.chars() {
            if is_cjk(c) {
                // CJK boundary: flush the pending word, emit the scalar alone.
                flush(&mut word, &mut terms);
                terms.push(c.to_string());
            } else if c.is_alphanumeric() {
                for lc in c.to_lowercase() {
                    word.push(lc);
                }
            } else {
                // Whitespace and punctuation both terminate the current word.
                flush(&mut word, &mut terms);
            }
        }
        flush(&mut word, &mut terms);
        terms
    }

    /// Term count without allocating the term vector.
    pub fn count_terms(&self, text: &str) -> usize {
        // Tokenization is cheap enough that the simple form wins here.
        self.tokenize(text).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_punctuation() {
        let toks = Tokenizer.tokenize("Hello, World! Rust-lang.");
        assert_eq!(toks, vec!["hello", "world", "rust", "lang"]);
    }

    #[test]
    fn drops_short_ascii_terms_and_stop_words() {
        let toks = Tokenizer.tokenize("it is a DOG in the house");
        assert_eq!(toks, vec!["dog", "house"]);
    }

    #[test]
    fn cjk_scalars_become_single_terms() {
        let toks = Tokenizer.tokenize("机器学习 ai");
        assert_eq!(toks, vec!["机", "器", "学", "习"]);
        // "ai" is only two ASCII chars, so it is dropped.
    }

    #[test]
    fn cjk_adjacent_to_ascii_splits_cleanly() {
        let toks = Tokenizer.tokenize("rust言語guide");
        assert_eq!(toks, vec!["rust", "言", "語", "guide"]);
    }

    #[test]
    fn empty_and_punctuation_only_inputs() {
        assert!(Tokenizer.tokenize("").is_empty());
        assert!(Tokenizer.tokenize("... !!! ---").is_empty());
    }
}
