//! The tokenizer contract (§6 of the spec) and its default implementation.
//!
//! A tokenizer is a pure function from file text to a mapping of token to the ordered byte
//! ranges at which it occurs. It knows nothing about files, paths, or revisions; those are
//! layered on top by `fsdex-core`.

use std::ops::Range;

use rustc_hash::FxHashMap;

/// Byte ranges, in textual order of occurrence, at which a single token appears.
pub type TokenRanges = Vec<Range<usize>>;

/// The full tokenization result for one piece of text: every distinct token mapped to its
/// occurrences, in the order they were first produced.
pub type TokenMap = FxHashMap<String, TokenRanges>;

/// A pluggable tokenizer. Implementors must uphold the contract from §6:
///
/// - ranges are half-open `[start, end)` and lie within `text`,
/// - ranges for a single token never overlap, though they may be adjacent,
/// - the function is pure: the same `text` always yields the same result.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> TokenMap;
}

impl<F> Tokenizer for F
where
    F: Fn(&str) -> TokenMap + Send + Sync,
{
    fn tokenize(&self, text: &str) -> TokenMap {
        self(text)
    }
}

/// The reference tokenizer: maximal runs of non-whitespace characters, using Unicode's
/// whitespace definition, with no case folding.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> TokenMap {
        let mut tokens: TokenMap = FxHashMap::default();
        let mut word_start: Option<usize> = None;

        for (idx, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(start) = word_start.take() {
                    push_token(&mut tokens, &text[start..idx], start..idx);
                }
            } else if word_start.is_none() {
                word_start = Some(idx);
            }
        }
        if let Some(start) = word_start {
            push_token(&mut tokens, &text[start..], start..text.len());
        }

        tokens
    }
}

fn push_token(tokens: &mut TokenMap, token: &str, range: Range<usize>) {
    tokens.entry(token.to_owned()).or_default().push(range);
}
