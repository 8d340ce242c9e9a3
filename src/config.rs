//! Configuration for the schema-constrained decoding core

/// Tunables for the DPDA×KeyTrie logit processor and its supporting caches.
///
/// Defaults match the values specified for the processor's per-request state
/// (`valueBias=2.5`, `eosBias=3.0`, `searchLimit<=50_000`) and the trie index's
/// default LRU capacity of 100 entries.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingConfig {
    /// Additive bonus applied to type-preferred tokens (soft bias).
    pub value_bias: f32,

    /// Additive bonus applied to EOS when the DPDA is in `done`; doubled in `error`.
    pub eos_bias: f32,

    /// Upper bound on vocabulary entries scanned when discovering special-token sets.
    pub search_limit: usize,

    /// Capacity of the `SchemaTrieIndex` LRU cache.
    pub trie_cache_capacity: usize,

    /// Maximum Levenshtein distance accepted by closest-key recovery.
    pub snap_max_distance: usize,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            value_bias: 2.5,
            eos_bias: 3.0,
            search_limit: 50_000,
            trie_cache_capacity: 100,
            snap_max_distance: 2,
        }
    }
}

/// Error type for [`DecodingConfig`] validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `value_bias` must be finite and non-negative.
    #[error("invalid value_bias: {0}. Must be finite and >= 0")]
    InvalidValueBias(f32),

    /// `eos_bias` must be finite and non-negative.
    #[error("invalid eos_bias: {0}. Must be finite and >= 0")]
    InvalidEosBias(f32),

    /// `search_limit` must not exceed the specified ceiling.
    #[error("invalid search_limit: {0}. Must be in (0, 50000]")]
    InvalidSearchLimit(usize),

    /// `trie_cache_capacity` must be positive.
    #[error("invalid trie_cache_capacity: {0}. Must be > 0")]
    InvalidTrieCacheCapacity(usize),
}

impl DecodingConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.value_bias.is_finite() || self.value_bias < 0.0 {
            return Err(ConfigError::InvalidValueBias(self.value_bias));
        }

        if !self.eos_bias.is_finite() || self.eos_bias < 0.0 {
            return Err(ConfigError::InvalidEosBias(self.eos_bias));
        }

        if self.search_limit == 0 || self.search_limit > 50_000 {
            return Err(ConfigError::InvalidSearchLimit(self.search_limit));
        }

        if self.trie_cache_capacity == 0 {
            return Err(ConfigError::InvalidTrieCacheCapacity(
                self.trie_cache_capacity,
            ));
        }

        Ok(())
    }

    /// Set the soft-bias bonus for type-preferred tokens.
    pub fn with_value_bias(mut self, value_bias: f32) -> Self {
        self.value_bias = value_bias;
        self
    }

    /// Set the EOS soft-bias bonus.
    pub fn with_eos_bias(mut self, eos_bias: f32) -> Self {
        self.eos_bias = eos_bias;
        self
    }

    /// Set the vocabulary-scan ceiling used for special-token discovery.
    pub fn with_search_limit(mut self, search_limit: usize) -> Self {
        self.search_limit = search_limit;
        self
    }

    /// Set the trie index LRU capacity.
    pub fn with_trie_cache_capacity(mut self, capacity: usize) -> Self {
        self.trie_cache_capacity = capacity;
        self
    }

    /// Set the maximum accepted Levenshtein distance for key recovery.
    pub fn with_snap_max_distance(mut self, distance: usize) -> Self {
        self.snap_max_distance = distance;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

        config.value_bias = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValueBias(_))
        ));
        config.value_bias = 2.5;

        config.search_limit = 50_001;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSearchLimit(_))
        ));
        config.search_limit = 50_000;

        config.trie_cache_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTrieCacheCapacity(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = DecodingConfig::new()
            .with_value_bias(1.0)
            .with_eos_bias(2.0)
            .with_search_limit(1000)
            .with_trie_cache_capacity(10)
            .with_snap_max_distance(3);

        assert_eq!(config.value_bias, 1.0);
        assert_eq!(config.eos_bias, 2.0);
        assert_eq!(config.search_limit, 1000);
        assert_eq!(config.trie_cache_capacity, 10);
        assert_eq!(config.snap_max_distance, 3);
        assert!(config.validate().is_ok());
    }
}
