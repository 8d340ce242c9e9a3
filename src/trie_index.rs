//! Per-schema trie index and its cross-request LRU cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::schema::{SchemaArena, SchemaKey, SchemaKind};
use crate::tokenizer::Tokenizer;
use crate::trie::TokenTrie;

/// A mapping from every object-kind [`SchemaKey`] in an arena to its token
/// trie, built by walking the schema once. Read-only and shared by
/// reference once built.
#[derive(Debug)]
pub struct SchemaTrieIndex {
    tries: FxHashMap<SchemaKey, TokenTrie>,
}

impl SchemaTrieIndex {
    /// Walk `arena` and build a trie for every object-kind node, including
    /// nested objects and array-item objects.
    #[must_use]
    pub fn build(arena: &SchemaArena, tokenizer: &dyn Tokenizer) -> Self {
        let mut tries = FxHashMap::default();
        Self::visit(arena, arena.root(), tokenizer, &mut tries);
        Self { tries }
    }

    fn visit(
        arena: &SchemaArena,
        key: SchemaKey,
        tokenizer: &dyn Tokenizer,
        tries: &mut FxHashMap<SchemaKey, TokenTrie>,
    ) {
        let Some(node) = arena.get(key) else { return };

        match node.kind {
            SchemaKind::Object => {
                let keys: Vec<String> = node.object_keys().into_iter().map(str::to_string).collect();
                tries.insert(key, TokenTrie::build(tokenizer, &keys));
                for &child in node.properties.values() {
                    Self::visit(arena, child, tokenizer, tries);
                }
            }
            SchemaKind::Array => {
                if let Some(items) = node.items {
                    Self::visit(arena, items, tokenizer, tries);
                }
            }
            _ => {}
        }
    }

    /// The trie built for the object-kind node at `key`, if any.
    #[must_use]
    pub fn trie_for(&self, key: SchemaKey) -> Option<&TokenTrie> {
        self.tries.get(&key)
    }
}

/// An explicit, bounded-capacity cache of [`SchemaTrieIndex`] values keyed by
/// `(tokenizer-fingerprint, schema-canonical-key)` — no process-global
/// singletons; explicit `get`/`put` semantics with interior mutex).
pub struct TrieIndexCache {
    cache: Mutex<LruCache<String, Arc<SchemaTrieIndex>>>,
}

impl TrieIndexCache {
    /// Create a cache with the given capacity.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("trie cache capacity must be > 0");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cache key for a given tokenizer fingerprint and canonical schema hash.
    #[must_use]
    pub fn key(tokenizer_fingerprint: &str, schema_canonical_key: &str) -> String {
        format!("{tokenizer_fingerprint}:{schema_canonical_key}")
    }

    /// Fetch a cached index, if present. Touches LRU recency.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<SchemaTrieIndex>> {
        self.cache.lock().get(key).cloned()
    }

    /// Insert or replace a cached index.
    pub fn put(&self, key: String, index: Arc<SchemaTrieIndex>) {
        self.cache.lock().put(key, index);
    }

    /// Explicitly evict an entry, returning it if present.
    pub fn evict(&self, key: &str) -> Option<Arc<SchemaTrieIndex>> {
        self.cache.lock().pop(key)
    }

    /// Number of entries currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
