//! The tokenizer interface consumed by the decoding core.
//!
//! Deliberately narrow: a real tokenizer library's wrapper implements these
//! seven methods without this crate depending on tokenizer internals. The
//! `tokenizers-adapter` feature provides a `TokenizersAdapter` over
//! `tokenizers::Tokenizer` for tests and examples; production callers supply
//! their own implementation.

use rustc_hash::FxHashSet;

/// A vocabulary token identifier.
pub type TokenId = i32;

/// The per-tokenizer sets of token-ids that decode to text containing each
/// significant JSON structural character, discovered once by scanning the
/// vocabulary.
#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    /// Tokens decoding to a string containing `"`.
    pub quote: FxHashSet<TokenId>,
    /// Tokens decoding to a string containing `{`.
    pub brace_open: FxHashSet<TokenId>,
    /// Tokens decoding to a string containing `}`.
    pub brace_close: FxHashSet<TokenId>,
    /// Tokens decoding to a string containing `[`.
    pub bracket_open: FxHashSet<TokenId>,
    /// Tokens decoding to a string containing `]`.
    pub bracket_close: FxHashSet<TokenId>,
    /// Tokens decoding to a string containing `,`.
    pub comma: FxHashSet<TokenId>,
    /// Tokens decoding to a string containing `:`.
    pub colon: FxHashSet<TokenId>,
    /// Tokens decoding to a string containing `\`.
    pub backslash: FxHashSet<TokenId>,
    /// Tokens decoding to a string made up entirely of JSON whitespace.
    pub whitespace: FxHashSet<TokenId>,
}

/// The tokenizer interface the decoding core depends on.
///
/// Implementations must be deterministic: the same token-id always decodes
/// to the same text for the lifetime of a generation request.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token-ids.
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Decode a sequence of token-ids back into text.
    fn decode(&self, ids: &[TokenId]) -> String;

    /// Decode a single token-id into its text.
    fn decode_token(&self, id: TokenId) -> String;

    /// The size of the vocabulary, if known.
    fn vocab_size(&self) -> Option<usize>;

    /// The end-of-sequence token-id, if the tokenizer defines one.
    fn eos_token_id(&self) -> Option<TokenId>;

    /// A stable fingerprint used to key the trie-index cache.
    ///
    /// Two tokenizers that would encode/decode identically should return the
    /// same fingerprint; changing vocabulary must change it.
    fn fingerprint(&self) -> String;
}

/// Scan the vocabulary (up to `search_limit` entries) and classify each
/// token by which JSON structural characters its decoded text contains.
///
/// The result should be computed once per tokenizer and frozen: memoize
/// results per-tokenizer and freeze after first use.
#[must_use]
pub fn discover_special_tokens(tokenizer: &dyn Tokenizer, search_limit: usize) -> SpecialTokens {
    let mut special = SpecialTokens::default();
    let Some(vocab_size) = tokenizer.vocab_size() else {
        return special;
    };
    let limit = vocab_size.min(search_limit);

    for id in 0..limit as TokenId {
        let text = tokenizer.decode_token(id);
        if text.is_empty() {
            continue;
        }
        if text.contains('"') {
            special.quote.insert(id);
        }
        if text.contains('{') {
            special.brace_open.insert(id);
        }
        if text.contains('}') {
            special.brace_close.insert(id);
        }
        if text.contains('[') {
            special.bracket_open.insert(id);
        }
        if text.contains(']') {
            special.bracket_close.insert(id);
        }
        if text.contains(',') {
            special.comma.insert(id);
        }
        if text.contains(':') {
            special.colon.insert(id);
        }
        if text.contains('\\') {
            special.backslash.insert(id);
        }
        if !text.is_empty() && text.chars().all(|c| c == ' ' || c == '\t' || c == '\n' || c == '\r') {
            special.whitespace.insert(id);
        }
    }

    special
}

#[cfg(feature = "tokenizers-adapter")]
mod adapter {
    use super::{TokenId, Tokenizer};

    /// Adapts `tokenizers::Tokenizer` to this crate's [`Tokenizer`] trait.
    ///
    /// Backs the integration tests and examples; production callers should
    /// prefer their own thin wrapper so this crate never depends on the
    /// concrete `tokenizers` type at the public API boundary.
    pub struct TokenizersAdapter {
        inner: tokenizers::Tokenizer,
    }

    impl TokenizersAdapter {
        /// Wrap an existing `tokenizers::Tokenizer`.
        #[must_use]
        pub fn new(inner: tokenizers::Tokenizer) -> Self {
            Self { inner }
        }
    }

    impl Tokenizer for TokenizersAdapter {
        fn encode(&self, text: &str) -> Vec<TokenId> {
            self.inner
                .encode(text, false)
                .map(|enc| enc.get_ids().iter().map(|&id| id as TokenId).collect())
                .unwrap_or_default()
        }

        fn decode(&self, ids: &[TokenId]) -> String {
            let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
            self.inner.decode(&ids, true).unwrap_or_default()
        }

        fn decode_token(&self, id: TokenId) -> String {
            self.inner.id_to_token(id as u32).unwrap_or_default()
        }

        fn vocab_size(&self) -> Option<usize> {
            Some(self.inner.get_vocab_size(false))
        }

        fn eos_token_id(&self) -> Option<TokenId> {
            const EOS_PATTERNS: &[&str] = &["<|endoftext|>", "</s>", "<eos>", "<|end|>", "[EOS]", "<end>"];
            EOS_PATTERNS
                .iter()
                .find_map(|pat| self.inner.token_to_id(pat))
                .map(|id| id as TokenId)
        }

        fn fingerprint(&self) -> String {
            format!(
                "tokenizers-v{}-eos{:?}",
                self.inner.get_vocab_size(false),
                self.eos_token_id()
            )
        }
    }
}

#[cfg(feature = "tokenizers-adapter")]
pub use adapter::TokenizersAdapter;

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTokenizer {
        vocab: Vec<&'static str>,
    }

    impl Tokenizer for MockTokenizer {
        fn encode(&self, text: &str) -> Vec<TokenId> {
            self.vocab
                .iter()
                .position(|&t| t == text)
                .map(|i| vec![i as TokenId])
                .unwrap_or_default()
        }

        fn decode(&self, ids: &[TokenId]) -> String {
            ids.iter().map(|&id| self.decode_token(id)).collect()
        }

        fn decode_token(&self, id: TokenId) -> String {
            self.vocab.get(id as usize).copied().unwrap_or("").to_string()
        }

        fn vocab_size(&self) -> Option<usize> {
            Some(self.vocab.len())
        }

        fn eos_token_id(&self) -> Option<TokenId> {
            self.vocab.iter().position(|&t| t == "<eos>").map(|i| i as TokenId)
        }

        fn fingerprint(&self) -> String {
            format!("mock-v{}", self.vocab.len())
        }
    }

    fn mock() -> MockTokenizer {
        MockTokenizer {
            vocab: vec!["{", "}", "[", "]", ",", ":", "\"", "\\", " ", "ab", "<eos>"],
        }
    }

    #[test]
    fn discovers_structural_tokens() {
        let tok = mock();
        let special = discover_special_tokens(&tok, 50_000);
        assert!(special.brace_open.contains(&0));
        assert!(special.brace_close.contains(&1));
        assert!(special.bracket_open.contains(&2));
        assert!(special.bracket_close.contains(&3));
        assert!(special.comma.contains(&4));
        assert!(special.colon.contains(&5));
        assert!(special.quote.contains(&6));
        assert!(special.backslash.contains(&7));
        assert!(special.whitespace.contains(&8));
        assert!(!special.whitespace.contains(&9));
    }

    #[test]
    fn respects_search_limit() {
        let tok = mock();
        let special = discover_special_tokens(&tok, 1);
        assert!(special.brace_open.contains(&0));
        assert!(!special.brace_close.contains(&1));
    }
}
