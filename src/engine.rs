//! The engine façade: caches trie indices per (tokenizer, schema), hands out
//! fresh processors per request, and validates finished output.

use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use log::debug;

use crate::config::DecodingConfig;
use crate::error::EngineError;
use crate::schema::{SchemaArena, SchemaKind, SchemaNode};
use crate::tokenizer::{SpecialTokens, Tokenizer, discover_special_tokens};
use crate::trie_index::{SchemaTrieIndex, TrieIndexCache};
use crate::processor::LogitProcessor;

/// Top-level entry point: one engine per tokenizer, shared across requests
/// that may use different schemas.
pub struct Engine {
    config: DecodingConfig,
    tokenizer: Arc<dyn Tokenizer>,
    cache: TrieIndexCache,
    /// Per-tokenizer-fingerprint `SpecialTokens`, discovered once and shared
    /// by every processor this engine hands out. Keyed on fingerprint rather
    /// than held as a single field so an engine could in principle serve
    /// requests across a rotated tokenizer without losing prior discoveries.
    special_tokens: DashMap<String, Arc<SpecialTokens>, ahash::RandomState>,
}

impl Engine {
    /// Build an engine bound to `tokenizer`, validating `config` first.
    pub fn new(config: DecodingConfig, tokenizer: Arc<dyn Tokenizer>) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = TrieIndexCache::new(config.trie_cache_capacity);
        Ok(Self {
            config,
            tokenizer,
            cache,
            special_tokens: DashMap::with_hasher(ahash::RandomState::new()),
        })
    }

    fn special_tokens(&self) -> Arc<SpecialTokens> {
        let fingerprint = self.tokenizer.fingerprint();
        if let Some(cached) = self.special_tokens.get(&fingerprint) {
            return cached.clone();
        }
        debug!("discovering special tokens for tokenizer {fingerprint}");
        let discovered = Arc::new(discover_special_tokens(
            self.tokenizer.as_ref(),
            self.config.search_limit,
        ));
        self.special_tokens.insert(fingerprint, discovered.clone());
        discovered
    }

    /// Parse `schema`, build or reuse a cached trie index for it, and
    /// return a fresh [`LogitProcessor`] ready for a new generation request.
    ///
    /// `schema_canonical_key` should be a stable identifier for `schema`
    /// (e.g. a hash of its canonical JSON form); the caller owns
    /// canonicalization since it may want to normalize field order or strip
    /// `$schema`/`title` metadata before hashing.
    pub fn start_request(
        &self,
        schema: &serde_json::Value,
        schema_canonical_key: &str,
    ) -> Result<LogitProcessor, EngineError> {
        let arena = Arc::new(SchemaArena::build(schema)?);
        let cache_key = TrieIndexCache::key(&self.tokenizer.fingerprint(), schema_canonical_key);

        let trie_index = match self.cache.get(&cache_key) {
            Some(cached) => {
                debug!("trie index cache hit for {cache_key}");
                cached
            }
            None => {
                debug!("trie index cache miss for {cache_key}; building");
                let built = Arc::new(SchemaTrieIndex::build(&arena, self.tokenizer.as_ref()));
                self.cache.put(cache_key, built.clone());
                built
            }
        };

        Ok(LogitProcessor::new_with_special_tokens(
            self.config.clone(),
            self.tokenizer.clone(),
            arena,
            trie_index,
            self.special_tokens(),
        ))
    }

    /// Compute a stable cache key for a schema document: a sorted-key
    /// canonical JSON rendering, hashed. A convenience for callers that
    /// would otherwise hand-roll their own `schema_canonical_key` for
    /// [`Engine::start_request`].
    pub fn canonical_schema_key(schema: &serde_json::Value) -> anyhow::Result<String> {
        use std::hash::{Hash, Hasher};

        let canonical = canonicalize(schema);
        let serialized =
            serde_json::to_string(&canonical).context("failed to serialize canonical schema form")?;

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        serialized.hash(&mut hasher);
        Ok(format!("{:016x}", hasher.finish()))
    }

    /// Evict a cached trie index, e.g. after a schema changes under a key
    /// the caller intends to reuse.
    pub fn evict_schema(&self, schema_canonical_key: &str) {
        let cache_key = TrieIndexCache::key(&self.tokenizer.fingerprint(), schema_canonical_key);
        self.cache.evict(&cache_key);
    }

    /// Number of trie indices currently cached.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Post-hoc structural validation of a finished generation against the
    /// parsed schema arena: the DPDA already guarantees
    /// syntactic well-formedness, so this only re-checks the parts the
    /// streaming processor cannot (required keys actually present, leaf
    /// value types matching the schema) by re-parsing the finished text.
    pub fn validate(schema: &serde_json::Value, generated: &str) -> Result<(), EngineError> {
        let arena = SchemaArena::build(schema)?;
        let value: serde_json::Value =
            serde_json::from_str(generated).map_err(|e| EngineError::Validation(e.to_string()))?;
        validate_value(&arena, arena.root(), &value).map_err(EngineError::Validation)
    }
}

/// Recursively sort object keys so structurally identical schemas hash the
/// same regardless of the field order they were authored in.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            sorted.sort_unstable_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

fn validate_value(arena: &SchemaArena, node_key: crate::schema::SchemaKey, value: &serde_json::Value) -> Result<(), String> {
    let Some(node) = arena.get(node_key) else {
        return Err("dangling schema node".to_string());
    };

    match node.kind {
        SchemaKind::Any => Ok(()),
        SchemaKind::Object => validate_object(arena, node, value),
        SchemaKind::Array => validate_array(arena, node, value),
        SchemaKind::String => match value {
            serde_json::Value::String(s) => validate_enum(node, s),
            _ => Err(format!("expected string, got {value}")),
        },
        SchemaKind::Number => {
            if value.is_number() {
                Ok(())
            } else {
                Err(format!("expected number, got {value}"))
            }
        }
        SchemaKind::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(format!("expected boolean, got {value}"))
            }
        }
        SchemaKind::Null => {
            if value.is_null() {
                Ok(())
            } else {
                Err(format!("expected null, got {value}"))
            }
        }
    }
}

fn validate_enum(node: &SchemaNode, s: &str) -> Result<(), String> {
    match &node.enum_values {
        Some(values) if !values.iter().any(|v| v == s) => {
            Err(format!("{s:?} is not one of the declared enum values"))
        }
        _ => Ok(()),
    }
}

fn validate_object(arena: &SchemaArena, node: &SchemaNode, value: &serde_json::Value) -> Result<(), String> {
    let Some(obj) = value.as_object() else {
        return Err(format!("expected object, got {value}"));
    };

    for required_key in &node.required {
        if !obj.contains_key(required_key) {
            return Err(format!("missing required key {required_key:?}"));
        }
    }

    for (key, child_value) in obj {
        let Some(&child_key) = node.properties.get(key) else {
            continue;
        };
        validate_value(arena, child_key, child_value)?;
    }

    Ok(())
}

fn validate_array(arena: &SchemaArena, node: &SchemaNode, value: &serde_json::Value) -> Result<(), String> {
    let Some(items) = value.as_array() else {
        return Err(format!("expected array, got {value}"));
    };

    let Some(item_schema) = node.items else {
        return Ok(());
    };

    for element in items {
        validate_value(arena, item_schema, element)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ByteTokenizer;
    impl Tokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> Vec<crate::tokenizer::TokenId> {
            text.bytes().map(crate::tokenizer::TokenId::from).collect()
        }
        fn decode(&self, ids: &[crate::tokenizer::TokenId]) -> String {
            ids.iter().map(|&id| id as u8 as char).collect()
        }
        fn decode_token(&self, id: crate::tokenizer::TokenId) -> String {
            (id as u8 as char).to_string()
        }
        fn vocab_size(&self) -> Option<usize> {
            Some(256)
        }
        fn eos_token_id(&self) -> Option<crate::tokenizer::TokenId> {
            Some(255)
        }
        fn fingerprint(&self) -> String {
            "byte-tokenizer".to_string()
        }
    }

    fn engine() -> Engine {
        Engine::new(DecodingConfig::default(), Arc::new(ByteTokenizer)).unwrap()
    }

    #[test]
    fn start_request_builds_and_caches_trie_index() {
        let engine = engine();
        let schema = json!({
            "type": "object",
            "properties": { "name": { "type": "string" } }
        });
        assert_eq!(engine.cache_len(), 0);
        let _processor = engine.start_request(&schema, "schema-a").unwrap();
        assert_eq!(engine.cache_len(), 1);
        let _processor2 = engine.start_request(&schema, "schema-a").unwrap();
        assert_eq!(engine.cache_len(), 1);
    }

    #[test]
    fn distinct_schema_keys_get_distinct_cache_entries() {
        let engine = engine();
        let schema_a = json!({ "type": "object" });
        let schema_b = json!({ "type": "array" });
        engine.start_request(&schema_a, "a").unwrap();
        engine.start_request(&schema_b, "b").unwrap();
        assert_eq!(engine.cache_len(), 2);
    }

    #[test]
    fn evict_schema_removes_cache_entry() {
        let engine = engine();
        let schema = json!({ "type": "object" });
        engine.start_request(&schema, "a").unwrap();
        assert_eq!(engine.cache_len(), 1);
        engine.evict_schema("a");
        assert_eq!(engine.cache_len(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = DecodingConfig::default().with_trie_cache_capacity(0);
        assert!(Engine::new(config, Arc::new(ByteTokenizer)).is_err());
    }

    #[test]
    fn special_tokens_are_discovered_once_and_reused() {
        let engine = engine();
        let schema = json!({ "type": "object" });
        engine.start_request(&schema, "a").unwrap();
        engine.start_request(&schema, "a").unwrap();
        assert_eq!(engine.special_tokens.len(), 1);
    }

    #[test]
    fn canonical_schema_key_ignores_field_order() {
        let a = json!({ "type": "object", "properties": { "name": {"type": "string"} } });
        let b = json!({ "properties": { "name": {"type": "string"} }, "type": "object" });
        assert_eq!(
            Engine::canonical_schema_key(&a).unwrap(),
            Engine::canonical_schema_key(&b).unwrap()
        );
    }

    #[test]
    fn canonical_schema_key_differs_for_different_schemas() {
        let a = json!({ "type": "object" });
        let b = json!({ "type": "array" });
        assert_ne!(
            Engine::canonical_schema_key(&a).unwrap(),
            Engine::canonical_schema_key(&b).unwrap()
        );
    }

    #[test]
    fn validate_accepts_conforming_output() {
        let schema = json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        });
        assert!(Engine::validate(&schema, r#"{"name":"Ada"}"#).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required_key() {
        let schema = json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        });
        assert!(Engine::validate(&schema, "{}").is_err());
    }

    #[test]
    fn validate_rejects_wrong_leaf_type() {
        let schema = json!({
            "type": "object",
            "properties": { "age": { "type": "number" } }
        });
        assert!(Engine::validate(&schema, r#"{"age":"old"}"#).is_err());
    }

    #[test]
    fn validate_rejects_out_of_enum_value() {
        let schema = json!({
            "type": "object",
            "properties": { "color": { "type": "string", "enum": ["red", "blue"] } }
        });
        assert!(Engine::validate(&schema, r#"{"color":"green"}"#).is_err());
        assert!(Engine::validate(&schema, r#"{"color":"red"}"#).is_ok());
    }

    #[test]
    fn validate_rejects_malformed_json() {
        let schema = json!({ "type": "object" });
        assert!(Engine::validate(&schema, "{not json}").is_err());
    }
}
