use constrained_gen::config::DecodingConfig;
use constrained_gen::error::EngineError;

#[test]
fn test_default_config() {
    let config = DecodingConfig::default();
    assert_eq!(config.value_bias, 2.5);
    assert_eq!(config.eos_bias, 3.0);
    assert_eq!(config.search_limit, 50_000);
    assert_eq!(config.trie_cache_capacity, 100);
    assert_eq!(config.snap_max_distance, 2);
    assert!(config.validate().is_ok());
}

#[test]
fn test_validation() {
    let mut config = DecodingConfig::default();

    config.value_bias = f32::NAN;
    assert!(config.validate().is_err());
    config.value_bias = 2.5;

    config.eos_bias = -1.0;
    assert!(config.validate().is_err());
    config.eos_bias = 3.0;

    config.search_limit = 0;
    assert!(config.validate().is_err());
    config.search_limit = 50_000;

    config.trie_cache_capacity = 0;
    assert!(config.validate().is_err());
    config.trie_cache_capacity = 100;

    assert!(config.validate().is_ok());
}

#[test]
fn test_builder_chain() {
    let config = DecodingConfig::new()
        .with_value_bias(1.5)
        .with_eos_bias(4.0)
        .with_search_limit(2_000)
        .with_trie_cache_capacity(16)
        .with_snap_max_distance(1);

    assert_eq!(config.value_bias, 1.5);
    assert_eq!(config.eos_bias, 4.0);
    assert_eq!(config.search_limit, 2_000);
    assert_eq!(config.trie_cache_capacity, 16);
    assert_eq!(config.snap_max_distance, 1);
    assert!(config.validate().is_ok());
}

#[test]
fn invalid_config_surfaces_through_engine_construction() {
    use std::sync::Arc;

    struct NullTokenizer;
    impl constrained_gen::tokenizer::Tokenizer for NullTokenizer {
        fn encode(&self, _text: &str) -> Vec<constrained_gen::tokenizer::TokenId> {
            Vec::new()
        }
        fn decode(&self, _ids: &[constrained_gen::tokenizer::TokenId]) -> String {
            String::new()
        }
        fn decode_token(&self, _id: constrained_gen::tokenizer::TokenId) -> String {
            String::new()
        }
        fn vocab_size(&self) -> Option<usize> {
            Some(0)
        }
        fn eos_token_id(&self) -> Option<constrained_gen::tokenizer::TokenId> {
            None
        }
        fn fingerprint(&self) -> String {
            "null".to_string()
        }
    }

    let bad = DecodingConfig::default().with_search_limit(0);
    let err = constrained_gen::engine::Engine::new(bad, Arc::new(NullTokenizer)).unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}
