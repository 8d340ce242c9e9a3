//! Error types for the constrained decoding core

use thiserror::Error;

/// Errors raised while building a [`crate::schema::SchemaNode`] tree from a JSON Schema document.
#[derive(Debug, Clone, Error)]
pub enum SchemaBuildError {
    /// A `"type"` value was present but not one of the recognized JSON Schema primitives.
    #[error("unrecognized schema type: {0}")]
    UnrecognizedType(String),

    /// The document used `$ref`, which this builder does not resolve.
    #[error("recursive/external $ref is not supported; flatten the schema upstream: {0}")]
    UnsupportedRef(String),

    /// The input was not a JSON object at all.
    #[error("schema document root must be a JSON object")]
    NotAnObject,

    /// A Rust type's derived `schemars` schema failed to serialize to JSON.
    #[error("failed to serialize derived schema for {type_name}: {reason}")]
    DerivedSchemaFailed {
        /// The Rust type name the schema was derived from.
        type_name: &'static str,
        /// The underlying serialization failure.
        reason: String,
    },
}

/// The fatal/non-fatal taxonomy surfaced by the logit processor.
#[derive(Debug, Clone, Error)]
pub enum ConstraintError {
    /// The model emitted a token that cannot extend the current key trie path.
    #[error("trie mismatch on partial key {0:?}")]
    TrieMismatch(String),

    /// The allowed-token set computed for the current phase was empty.
    #[error("allowed token set is empty")]
    EmptyAllowedTokens,

    /// The JSON DPDA reached its `error` phase.
    #[error("DPDA reached an invalid phase")]
    InvalidPhase,

    /// The post-hoc validator rejected the concatenated generation output.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

impl ConstraintError {
    /// Whether this error is fatal: structural errors
    /// terminate the stream; `InvalidPhase` is recovered via EOS boost instead.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConstraintError::TrieMismatch(_) | ConstraintError::EmptyAllowedTokens
        )
    }
}

/// Errors surfaced by the abortable streamer.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// A fatal constraint error was observed; generation is torn down at this position.
    #[error("aborted due to error at token position {position}: {source}")]
    AbortedDueToError {
        /// 1-based count of tokens yielded before the abort was observed.
        position: usize,
        /// The fatal error that triggered the abort.
        source: ConstraintError,
    },

    /// The stream was cooperatively cancelled.
    #[error("generation cancelled")]
    Cancelled,

    /// The upstream token producer failed; propagated untouched.
    #[error("producer error: {0}")]
    Producer(String),
}

/// Errors surfaced by the engine façade.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Schema construction failed.
    #[error(transparent)]
    Schema(#[from] SchemaBuildError),

    /// Generation was torn down by the abortable streamer.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The post-hoc validator rejected the final output.
    #[error("schema violation: {0}")]
    Validation(String),

    /// Configuration was invalid.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Crate-wide result alias used at module boundaries.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
