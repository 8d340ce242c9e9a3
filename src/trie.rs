//! Token-level key trie: a tree whose edges are vocabulary token-ids and
//! whose root-to-terminal paths encode allowed JSON object key strings.

use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};

use crate::tokenizer::{TokenId, Tokenizer};

new_key_type! {
    struct NodeKey;
}

#[derive(Debug, Default)]
struct Node {
    children: FxHashMap<TokenId, NodeKey>,
    terminal: bool,
    key_name: Option<String>,
}

/// An immutable trie over the token-id sequences of an object schema's keys.
///
/// Built once per distinct object-kind schema node and stored inside a
/// `SchemaTrieIndex`; all mutation is confined to [`TokenTrie::build`].
#[derive(Debug)]
pub struct TokenTrie {
    nodes: SlotMap<NodeKey, Node>,
    root: NodeKey,
    all_keys: Vec<String>,
}

impl TokenTrie {
    /// Build a trie from the unique keys of an object schema, encoding each
    /// with `tokenizer`. Duplicate keys (possible after normalization
    /// upstream) collapse onto the same terminal idempotently; empty token
    /// sequences are ignored.
    #[must_use]
    pub fn build(tokenizer: &dyn Tokenizer, keys: &[String]) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node::default());
        let mut all_keys = Vec::with_capacity(keys.len());

        for key in keys {
            let tokens = tokenizer.encode(key);
            if tokens.is_empty() {
                continue;
            }
            all_keys.push(key.clone());

            let mut cursor = root;
            for token in tokens {
                let existing = nodes[cursor].children.get(&token).copied();
                cursor = match existing {
                    Some(next) => next,
                    None => {
                        let created = nodes.insert(Node::default());
                        nodes[cursor].children.insert(token, created);
                        created
                    }
                };
            }
            nodes[cursor].terminal = true;
            nodes[cursor].key_name = Some(key.clone());
        }

        Self { nodes, root, all_keys }
    }

    /// All key strings successfully inserted (i.e. whose token sequence was
    /// non-empty).
    #[must_use]
    pub fn all_keys(&self) -> &[String] {
        &self.all_keys
    }

    fn root_path(&self) -> Path {
        Path { current: self.root }
    }
}

/// A cursor into a [`TokenTrie`]: the current node, reachable by the tokens
/// consumed so far.
#[derive(Debug, Clone, Copy)]
pub struct Path {
    current: NodeKey,
}

impl Path {
    /// A fresh cursor at `trie`'s root.
    #[must_use]
    pub fn new(trie: &TokenTrie) -> Self {
        trie.root_path()
    }

    /// Attempt to descend via `token`. Returns `false` (path unchanged) if
    /// `token` is not a child of the current node — signaling trie-mismatch
    /// to the caller.
    #[must_use]
    pub fn append(&mut self, token: TokenId, trie: &TokenTrie) -> bool {
        match trie.nodes[self.current].children.get(&token) {
            Some(&next) => {
                self.current = next;
                true
            }
            None => false,
        }
    }

    /// Whether the current node is a terminal (a complete key has been spelled).
    #[must_use]
    pub fn is_at_terminal(&self, trie: &TokenTrie) -> bool {
        trie.nodes[self.current].terminal
    }

    /// The key name at the current terminal, if any.
    #[must_use]
    pub fn key_name<'a>(&self, trie: &'a TokenTrie) -> Option<&'a str> {
        trie.nodes[self.current].key_name.as_deref()
    }

    /// Reset the cursor back to `trie`'s root.
    pub fn reset(&mut self, trie: &TokenTrie) {
        self.current = trie.root;
    }

    /// The set of tokens that can extend the current path.
    #[must_use]
    pub fn allowed_tokens(&self, trie: &TokenTrie) -> Vec<TokenId> {
        trie.nodes[self.current].children.keys().copied().collect()
    }

    /// Whether the current node is a terminal (alias matching the
    /// `canComplete` query name).
    #[must_use]
    pub fn can_complete(&self, trie: &TokenTrie) -> bool {
        self.is_at_terminal(trie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockTokenizer;
    impl Tokenizer for MockTokenizer {
        fn encode(&self, text: &str) -> Vec<TokenId> {
            text.bytes().map(TokenId::from).collect()
        }
        fn decode(&self, ids: &[TokenId]) -> String {
            ids.iter().map(|&id| id as u8 as char).collect()
        }
        fn decode_token(&self, id: TokenId) -> String {
            (id as u8 as char).to_string()
        }
        fn vocab_size(&self) -> Option<usize> {
            Some(256)
        }
        fn eos_token_id(&self) -> Option<TokenId> {
            None
        }
        fn fingerprint(&self) -> String {
            "mock-byte-tokenizer".to_string()
        }
    }

    #[test]
    fn builds_and_walks_single_key() {
        let tok = MockTokenizer;
        let trie = TokenTrie::build(&tok, &["name".to_string()]);
        let mut path = Path::new(&trie);
        for &b in b"name" {
            assert!(path.append(b as TokenId, &trie));
        }
        assert!(path.is_at_terminal(&trie));
        assert_eq!(path.key_name(&trie), Some("name"));
    }

    #[test]
    fn failed_append_leaves_path_unchanged() {
        let tok = MockTokenizer;
        let trie = TokenTrie::build(&tok, &["alpha".to_string()]);
        let mut path = Path::new(&trie);
        assert!(path.append(b'a' as TokenId, &trie));
        assert!(!path.append(b'z' as TokenId, &trie));
        // Still positioned after 'a'; 'l' should succeed.
        assert!(path.append(b'l' as TokenId, &trie));
    }

    #[test]
    fn shared_prefix_keys_branch_correctly() {
        let tok = MockTokenizer;
        let trie = TokenTrie::build(
            &tok,
            &["first".to_string(), "firts".to_string(), "second".to_string()],
        );
        let mut path = Path::new(&trie);
        for &b in b"first" {
            assert!(path.append(b as TokenId, &trie));
        }
        assert!(path.is_at_terminal(&trie));
        assert_eq!(path.key_name(&trie), Some("first"));
    }

    #[test]
    fn empty_token_sequence_ignored() {
        struct EmptyTokenizer;
        impl Tokenizer for EmptyTokenizer {
            fn encode(&self, _text: &str) -> Vec<TokenId> {
                vec![]
            }
            fn decode(&self, _ids: &[TokenId]) -> String {
                String::new()
            }
            fn decode_token(&self, _id: TokenId) -> String {
                String::new()
            }
            fn vocab_size(&self) -> Option<usize> {
                Some(0)
            }
            fn eos_token_id(&self) -> Option<TokenId> {
                None
            }
            fn fingerprint(&self) -> String {
                "mock-empty-tokenizer".to_string()
            }
        }
        let trie = TokenTrie::build(&EmptyTokenizer, &["name".to_string()]);
        assert!(trie.all_keys().is_empty());
    }
}
