//! Schema-constrained decoding core for structured LLM generation.
//!
//! A DPDA×KeyTrie logit processor that constrains an autoregressive model's
//! token-by-token sampling to the shape of a JSON Schema, one phase
//! transition at a time:
//!
//! - [`schema`] normalizes an input JSON Schema document into a flat
//!   `slotmap` arena ([`schema::SchemaArena`]).
//! - [`trie`] builds a token-id trie over an object schema's property keys,
//!   so the model can only emit key spellings the schema actually declares.
//! - [`trie_index`] maps every object-kind schema node to its trie and
//!   caches that mapping across requests.
//! - [`dpda`] is a byte-level JSON parser tracking a closed phase
//!   enumeration; it is the source of truth for "what can come next"
//!   independent of the schema.
//! - [`context`] mirrors the DPDA's container stack with schema-aware
//!   frames, so the processor always knows which schema node governs the
//!   value currently being produced.
//! - [`recovery`] snaps a mis-generated object key back to the nearest
//!   schema-declared key via normalization and Levenshtein distance.
//! - [`processor`] ties the above together: [`processor::LogitProcessor`]
//!   hard-masks and soft-biases a model's raw logits before sampling, then
//!   commits the sampled token and advances all of the above in lockstep.
//! - [`stream`] wraps a token producer in an abortable stream that tears
//!   down generation on a fatal constraint error and supports cooperative
//!   cancellation.
//! - [`engine`] is the façade: caches trie indices per (tokenizer, schema),
//!   hands out fresh processors per request, and validates finished output.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use constrained_gen::config::DecodingConfig;
//! use constrained_gen::engine::Engine;
//! # use constrained_gen::tokenizer::Tokenizer;
//! # fn example(tokenizer: Arc<dyn Tokenizer>) -> constrained_gen::error::Result<()> {
//! let engine = Engine::new(DecodingConfig::default(), tokenizer)?;
//! let schema = serde_json::json!({
//!     "type": "object",
//!     "properties": { "name": { "type": "string" } },
//!     "required": ["name"]
//! });
//! let mut processor = engine.start_request(&schema, "person-v1")?;
//! let mut logits = vec![0.0f32; 32_000];
//! processor.process(&mut logits);
//! // sample a token id from `logits`, then:
//! // processor.did_sample(sampled_id);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod context;
pub mod dpda;
pub mod engine;
pub mod error;
pub mod processor;
pub mod recovery;
pub mod schema;
pub mod stream;
pub mod tokenizer;
pub mod trie;
pub mod trie_index;

pub use config::DecodingConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use processor::LogitProcessor;
pub use schema::{SchemaArena, SchemaKey, SchemaKind, SchemaNode};
pub use stream::{AbortableStream, AbortableTokenStream, StreamItem, TokenProducer};
pub use tokenizer::{SpecialTokens, Tokenizer, TokenId};
