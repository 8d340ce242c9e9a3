//! The DPDA×KeyTrie logit processor — the core of this crate.
//!
//! Three operations drive a generation stream: [`LogitProcessor::prompt`]
//! resets all per-request state, [`LogitProcessor::process`] reshapes the
//! model's raw logit vector before sampling, and [`LogitProcessor::did_sample`]
//! commits the sampled token, advancing the DPDA, trie path, key buffer, and
//! context stack.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::DecodingConfig;
use crate::context::ContextStack;
use crate::dpda::{ArrayPhase, ContainerFrame, Dpda, ObjectPhase, Phase, StringKind, StringPhase};
use crate::error::ConstraintError;
use crate::recovery;
use crate::schema::{SchemaArena, SchemaKey, SchemaKind};
use crate::tokenizer::{SpecialTokens, Tokenizer, TokenId, discover_special_tokens};
use crate::trie;
use crate::trie_index::SchemaTrieIndex;

/// Coarse classification of [`LogitProcessor::last_error`], stored in a
/// lock-free cell so the abortable streamer can poll it without a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ErrorKind {
    None = 0,
    TrieMismatch = 1,
    EmptyAllowedTokens = 2,
    InvalidPhase = 3,
}

impl From<u8> for ErrorKind {
    fn from(v: u8) -> Self {
        match v {
            1 => ErrorKind::TrieMismatch,
            2 => ErrorKind::EmptyAllowedTokens,
            3 => ErrorKind::InvalidPhase,
            _ => ErrorKind::None,
        }
    }
}

#[derive(Debug, Default)]
struct ErrorCell(AtomicU8);

impl ErrorCell {
    fn set(&self, kind: ErrorKind) {
        self.0.store(kind as u8, Ordering::Relaxed);
    }

    fn get(&self) -> ErrorKind {
        ErrorKind::from(self.0.load(Ordering::Relaxed))
    }

    fn clear(&self) {
        self.set(ErrorKind::None);
    }
}

/// The hard-masking outcome for the current phase: either every token is
/// permitted (value-string content, numbers, literals — unconstrained at
/// the hard-mask level), or exactly the given set.
enum AllowedSet {
    All,
    Tokens(FxHashSet<TokenId>),
}

/// Per-request mutable state driving schema-constrained decoding.
///
/// Owned exclusively by the generation task that drives it; the only shared,
/// read-only state is the `Arc`-held schema arena, trie index, and special-
/// token cache.
pub struct LogitProcessor {
    config: DecodingConfig,
    tokenizer: Arc<dyn Tokenizer>,
    arena: Arc<SchemaArena>,
    trie_index: Arc<SchemaTrieIndex>,
    special: Arc<SpecialTokens>,

    dpda: Dpda,
    context_stack: ContextStack,

    current_node: Option<SchemaKey>,
    current_array_item_schema: Option<SchemaKey>,
    trie_path: Option<trie::Path>,
    /// Whether `trie_path` still faithfully tracks the key text sampled so
    /// far. Cleared on a failed token-level append; the raw text accumulated
    /// by the DPDA's own key buffer is the source of truth regardless, so a
    /// desync only degrades masking quality until the next key boundary,
    /// where [`recovery::snap`] gets a chance to recover it.
    trie_synced: bool,
    confirmed_key: Option<String>,

    error_cell: ErrorCell,
    last_error: Option<ConstraintError>,
    retry_count: usize,
    token_search_cache: FxHashMap<String, Arc<[TokenId]>>,
}

impl LogitProcessor {
    /// Build a new processor bound to a pre-built (and typically cached)
    /// trie index. Special-token discovery runs once here; prefer
    /// [`LogitProcessor::new_with_special_tokens`] when the caller already
    /// has a per-tokenizer set cached, since a vocabulary scan on every
    /// request is wasted work once the tokenizer is fixed.
    #[must_use]
    pub fn new(
        config: DecodingConfig,
        tokenizer: Arc<dyn Tokenizer>,
        arena: Arc<SchemaArena>,
        trie_index: Arc<SchemaTrieIndex>,
    ) -> Self {
        let special = Arc::new(discover_special_tokens(tokenizer.as_ref(), config.search_limit));
        Self::new_with_special_tokens(config, tokenizer, arena, trie_index, special)
    }

    /// Build a new processor from a pre-computed [`SpecialTokens`] set,
    /// skipping the vocabulary scan. The set is frozen per tokenizer: callers
    /// that serve many requests against the same tokenizer should discover
    /// it once and share the `Arc` across every processor they construct.
    #[must_use]
    pub fn new_with_special_tokens(
        config: DecodingConfig,
        tokenizer: Arc<dyn Tokenizer>,
        arena: Arc<SchemaArena>,
        trie_index: Arc<SchemaTrieIndex>,
        special: Arc<SpecialTokens>,
    ) -> Self {
        let mut processor = Self {
            config,
            tokenizer,
            arena,
            trie_index,
            special,
            dpda: Dpda::new(),
            context_stack: ContextStack::new(),
            current_node: None,
            current_array_item_schema: None,
            trie_path: None,
            trie_synced: true,
            confirmed_key: None,
            error_cell: ErrorCell::default(),
            last_error: None,
            retry_count: 0,
            token_search_cache: FxHashMap::default(),
        };
        processor.prompt(&[]);
        processor
    }

    /// Reset all per-request state to the schema root. `prompt_tokens` is
    /// accepted for API parity but not otherwise consulted — the
    /// constrained output begins fresh regardless of preceding prompt text.
    pub fn prompt(&mut self, _prompt_tokens: &[TokenId]) {
        self.dpda.reset();
        self.context_stack.clear();
        self.trie_synced = true;
        self.confirmed_key = None;
        self.error_cell.clear();
        self.last_error = None;
        self.retry_count = 0;

        let root = self.arena.root();
        match self.arena.get(root).map(|n| n.kind) {
            Some(SchemaKind::Object) => {
                self.current_node = Some(root);
                self.current_array_item_schema = None;
                self.trie_path = self.trie_index.trie_for(root).map(trie::Path::new);
            }
            Some(SchemaKind::Array) => {
                self.current_node = None;
                self.current_array_item_schema = self.arena.get(root).and_then(|n| n.items);
                self.trie_path = None;
            }
            _ => {
                self.current_node = None;
                self.current_array_item_schema = None;
                self.trie_path = None;
            }
        }
    }

    /// The DPDA's current phase, exposed for diagnostics and tests.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.dpda.phase()
    }

    /// The key resolved for the value about to be produced, if any.
    #[must_use]
    pub fn confirmed_key(&self) -> Option<&str> {
        self.confirmed_key.as_deref()
    }

    /// Whether a fatal (stream-terminating) error has been observed since
    /// the last reset. Lock-free: safe for the abortable streamer to poll
    /// between yielded tokens.
    #[must_use]
    pub fn has_fatal_error(&self) -> bool {
        matches!(self.error_cell.get(), ErrorKind::TrieMismatch | ErrorKind::EmptyAllowedTokens)
    }

    /// Whether any error (fatal or not) has been observed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        !matches!(self.error_cell.get(), ErrorKind::None)
    }

    /// The detailed error payload, if any. Safe to read immediately after
    /// observing a non-`None` [`ErrorCell`] state because `process` and
    /// `did_sample` alternate strictly within a single generation task.
    #[must_use]
    pub fn last_error(&self) -> Option<&ConstraintError> {
        self.last_error.as_ref()
    }

    /// Take and clear the last recorded error.
    pub fn take_last_error(&mut self) -> Option<ConstraintError> {
        self.error_cell.clear();
        self.last_error.take()
    }

    fn record_error(&mut self, err: ConstraintError) {
        self.error_cell.set(match &err {
            ConstraintError::TrieMismatch(_) => ErrorKind::TrieMismatch,
            ConstraintError::EmptyAllowedTokens => ErrorKind::EmptyAllowedTokens,
            ConstraintError::InvalidPhase | ConstraintError::SchemaViolation(_) => ErrorKind::InvalidPhase,
        });
        self.last_error = Some(err);
    }

    /// Clear a `TrieMismatch` recorded provisionally on a failed token-level
    /// append, once `resolve_confirmed_key` snaps the closed key successfully
    /// after all. Leaves any other pending error untouched.
    fn clear_provisional_trie_mismatch(&mut self) {
        if matches!(self.last_error, Some(ConstraintError::TrieMismatch(_))) {
            self.error_cell.clear();
            self.last_error = None;
        }
    }

    /// Reshape `logits` in place: hard-mask tokens outside the allowed set
    /// for the current phase (leaving EOS always sampleable), then add the
    /// soft `value_bias` to type-preferred tokens.
    pub fn process(&mut self, logits: &mut [f32]) {
        let eos = self.tokenizer.eos_token_id();
        let phase = self.dpda.phase();
        let (allowed, preferred) = self.allowed_and_preferred();

        let mut allowed_was_empty = false;
        match &allowed {
            AllowedSet::All => {}
            AllowedSet::Tokens(set) => {
                if set.is_empty() {
                    allowed_was_empty = true;
                    self.record_error(ConstraintError::EmptyAllowedTokens);
                } else {
                    for (id, logit) in logits.iter_mut().enumerate() {
                        let tid = id as TokenId;
                        if Some(tid) == eos {
                            continue;
                        }
                        if !set.contains(&tid) {
                            *logit = f32::NEG_INFINITY;
                        }
                    }
                }
            }
        }

        for tid in &preferred {
            if let Some(l) = logits.get_mut(*tid as usize) {
                *l += self.config.value_bias;
            }
        }

        let Some(eos_id) = eos else { return };
        let Some(eos_logit) = logits.get_mut(eos_id as usize) else { return };
        match phase {
            Phase::Done => *eos_logit += 2.0 * self.config.eos_bias,
            Phase::Error => {
                *eos_logit += 2.0 * self.config.eos_bias;
                self.record_error(ConstraintError::InvalidPhase);
            }
            _ if matches!(allowed, AllowedSet::All) || allowed_was_empty => {
                *eos_logit += self.config.eos_bias;
            }
            _ => {}
        }
    }

    /// Commit a sampled token: decode it, advance the trie path if the
    /// current phase is an in-progress object key, then fold its characters
    /// through the DPDA and apply the resulting side effects to the context
    /// stack.
    pub fn did_sample(&mut self, token_id: TokenId) {
        let text = self.tokenizer.decode_token(token_id);
        let phase_before_token = self.dpda.phase();

        if let Phase::InString(StringPhase::Body { kind: StringKind::Key, escaped }) = phase_before_token
            && self.trie_synced
            && !Self::token_closes_key_string(&text, escaped)
        {
            match (self.current_node.and_then(|k| self.trie_index.trie_for(k)), self.trie_path.as_mut()) {
                (Some(trie), Some(path)) if path.append(token_id, trie) => {}
                _ => {
                    self.trie_synced = false;
                    // Provisional: a key that later closes still gets a chance to
                    // recover via `recovery::snap` in `resolve_confirmed_key`, which
                    // clears this if it succeeds. A key that never closes (e.g. EOS
                    // mid-key) leaves this set, so the mismatch is still observable.
                    let partial = format!("{}{text}", self.dpda.key_buffer());
                    self.record_error(ConstraintError::TrieMismatch(partial));
                }
            }
        }

        for c in text.chars() {
            let prev_phase = self.dpda.phase();
            let prev_depth = self.dpda.depth();
            self.dpda.process_character(c);
            let new_phase = self.dpda.phase();
            let new_depth = self.dpda.depth();

            if matches!(new_phase, Phase::InObject(ObjectPhase::ExpectColon))
                && !matches!(prev_phase, Phase::InObject(ObjectPhase::ExpectColon))
            {
                self.resolve_confirmed_key();
            }

            // A root-level `{`/`[` (prev_depth == 0) needs no push: `prompt`
            // and `restore_root_context` already bind `current_node` /
            // `current_array_item_schema` to the schema root.
            if new_depth > prev_depth && prev_depth > 0 {
                let governing = self.governing_schema_key(prev_phase);
                match self.dpda.stack().last() {
                    Some(ContainerFrame::Object) => self.push_object_frame(governing),
                    Some(ContainerFrame::Array) => self.push_array_frame(governing),
                    None => {}
                }
            } else if new_depth < prev_depth {
                self.pop_frame();
            }
        }
    }

    /// Whether `text` (decoded from a token sampled while in a key string
    /// body) contains an unescaped closing quote, given the body's escape
    /// state at the start of the token.
    ///
    /// A token whose text mixes key content with the closing quote (e.g.
    /// `me"`) is treated as closing for trie-append purposes: the trie
    /// operates on whole tokens and cannot meaningfully absorb a partial
    /// token that also terminates the string.
    fn token_closes_key_string(text: &str, start_escaped: bool) -> bool {
        let mut escaped = start_escaped;
        for c in text.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '"' => return true,
                _ => {}
            }
        }
        false
    }

    /// Resolve the key just closed: a synced trie path that reached a
    /// terminal wins outright; otherwise the raw text the DPDA accumulated
    /// is snapped against the schema's known keys; a key with no candidate
    /// within `snap_max_distance` is a fatal trie mismatch.
    fn resolve_confirmed_key(&mut self) {
        let raw_key = self.dpda.current_key().unwrap_or_default().to_string();

        self.confirmed_key = match self.current_node.and_then(|k| self.trie_index.trie_for(k)) {
            Some(trie) => {
                let trie_hit = self.trie_synced && self.trie_path.as_ref().is_some_and(|p| p.can_complete(trie));
                if trie_hit {
                    self.trie_path.as_ref().and_then(|p| p.key_name(trie)).map(str::to_string)
                } else if let Some(snapped) = recovery::snap(&raw_key, trie.all_keys(), self.config.snap_max_distance) {
                    self.clear_provisional_trie_mismatch();
                    Some(snapped)
                } else {
                    self.record_error(ConstraintError::TrieMismatch(raw_key.clone()));
                    Some(raw_key)
                }
            }
            None => Some(raw_key),
        };

        self.trie_synced = true;
        if let Some(node_key) = self.current_node
            && let Some(trie) = self.trie_index.trie_for(node_key)
        {
            self.trie_path = Some(trie::Path::new(trie));
        }
    }

    fn governing_schema_key(&self, prev_phase: Phase) -> Option<SchemaKey> {
        match prev_phase {
            Phase::InObject(ObjectPhase::ExpectValueStart) => self.current_node.and_then(|node_key| {
                self.arena
                    .get(node_key)
                    .and_then(|node| self.confirmed_key.as_ref().and_then(|k| node.properties.get(k).copied()))
            }),
            Phase::InArray(ArrayPhase::ExpectValue) => self.current_array_item_schema,
            _ => None,
        }
    }

    fn push_object_frame(&mut self, governing: Option<SchemaKey>) {
        let allowed_keys: FxHashSet<String> = governing
            .and_then(|k| self.arena.get(k))
            .map(|node| node.properties.keys().cloned().collect())
            .unwrap_or_default();
        self.context_stack.push_object(governing, allowed_keys);
        self.current_node = governing;
        self.current_array_item_schema = None;
        self.trie_path = governing.and_then(|k| self.trie_index.trie_for(k)).map(trie::Path::new);
        self.trie_synced = true;
        self.confirmed_key = None;
    }

    fn push_array_frame(&mut self, governing: Option<SchemaKey>) {
        let item_schema = governing.and_then(|k| self.arena.get(k)).and_then(|node| node.items);
        self.context_stack.push_array(item_schema);
        self.current_array_item_schema = item_schema;
        self.current_node = None;
        self.trie_path = None;
        self.trie_synced = true;
        self.confirmed_key = None;
    }

    fn pop_frame(&mut self) {
        self.context_stack.pop();
        match self.context_stack.top() {
            Some(crate::context::ContextFrame::Object { node, .. }) => {
                self.current_node = *node;
                self.current_array_item_schema = None;
                self.trie_path = node.and_then(|k| self.trie_index.trie_for(k)).map(trie::Path::new);
            }
            Some(crate::context::ContextFrame::Array { item_schema }) => {
                self.current_array_item_schema = *item_schema;
                self.current_node = None;
                self.trie_path = None;
            }
            None => self.restore_root_context(),
        }
        self.trie_synced = true;
        self.confirmed_key = None;
    }

    fn restore_root_context(&mut self) {
        let root = self.arena.root();
        match self.arena.get(root).map(|n| n.kind) {
            Some(SchemaKind::Object) => {
                self.current_node = Some(root);
                self.current_array_item_schema = None;
                self.trie_path = self.trie_index.trie_for(root).map(trie::Path::new);
            }
            Some(SchemaKind::Array) => {
                self.current_node = None;
                self.current_array_item_schema = self.arena.get(root).and_then(|n| n.items);
                self.trie_path = None;
            }
            _ => {
                self.current_node = None;
                self.current_array_item_schema = None;
                self.trie_path = None;
            }
        }
    }

    fn allowed_and_preferred(&mut self) -> (AllowedSet, FxHashSet<TokenId>) {
        match self.dpda.phase() {
            Phase::Root => {
                let mut set: FxHashSet<TokenId> = self.special.brace_open.iter().copied().collect();
                set.extend(self.special.bracket_open.iter().copied());
                set.extend(self.special.quote.iter().copied());
                (AllowedSet::Tokens(set), FxHashSet::default())
            }

            Phase::InObject(ObjectPhase::ExpectKeyOrEnd) => {
                let mut set: FxHashSet<TokenId> = self.special.quote.iter().copied().collect();
                set.extend(self.special.brace_close.iter().copied());
                (AllowedSet::Tokens(set), FxHashSet::default())
            }

            Phase::InObject(ObjectPhase::ExpectKey) => {
                (AllowedSet::Tokens(self.special.quote.iter().copied().collect()), FxHashSet::default())
            }

            Phase::InString(StringPhase::Body { kind: StringKind::Key, escaped: false }) => {
                (AllowedSet::Tokens(self.key_trie_allowed()), FxHashSet::default())
            }

            Phase::InObject(ObjectPhase::ExpectColon) => {
                (AllowedSet::Tokens(self.special.colon.iter().copied().collect()), FxHashSet::default())
            }

            Phase::InObject(ObjectPhase::ExpectValueStart) => {
                let mut set: FxHashSet<TokenId> = self.special.quote.iter().copied().collect();
                set.extend(self.special.brace_open.iter().copied());
                set.extend(self.special.bracket_open.iter().copied());
                let preferred = self.value_preferred_for_object();
                (AllowedSet::Tokens(set), preferred)
            }

            Phase::InObject(ObjectPhase::AfterValue) => {
                let mut set: FxHashSet<TokenId> = self.special.comma.iter().copied().collect();
                set.extend(self.special.brace_close.iter().copied());
                (AllowedSet::Tokens(set), FxHashSet::default())
            }

            Phase::InArray(ArrayPhase::ExpectValue) => {
                let mut set: FxHashSet<TokenId> = self.special.bracket_close.iter().copied().collect();
                set.extend(self.special.quote.iter().copied());
                set.extend(self.special.brace_open.iter().copied());
                set.extend(self.special.bracket_open.iter().copied());
                let preferred = self.value_preferred_for_array();
                (AllowedSet::Tokens(set), preferred)
            }

            Phase::InArray(ArrayPhase::AfterValue) => {
                let mut set: FxHashSet<TokenId> = self.special.comma.iter().copied().collect();
                set.extend(self.special.bracket_close.iter().copied());
                (AllowedSet::Tokens(set), FxHashSet::default())
            }

            // Value-string content, numbers, literals, and mid-escape key
            // subphases are unconstrained at the hard-mask level: the
            // DPDA still rejects malformed continuations character
            // by character in `did_sample`, driving `Error` and its EOS
            // boost on the next `process` call.
            _ => (AllowedSet::All, FxHashSet::default()),
        }
    }

    fn key_trie_allowed(&mut self) -> FxHashSet<TokenId> {
        let fallback = |special: &SpecialTokens| -> FxHashSet<TokenId> {
            let mut set: FxHashSet<TokenId> = special.quote.iter().copied().collect();
            set.extend(special.backslash.iter().copied());
            set
        };

        if !self.trie_synced {
            return fallback(&self.special);
        }
        let Some(node_key) = self.current_node else {
            return fallback(&self.special);
        };
        let Some(trie) = self.trie_index.trie_for(node_key) else {
            return fallback(&self.special);
        };
        let Some(path) = &self.trie_path else {
            return fallback(&self.special);
        };

        let mut set: FxHashSet<TokenId> = path.allowed_tokens(trie).into_iter().collect();
        set.extend(self.special.backslash.iter().copied());
        if path.can_complete(trie) {
            set.extend(self.special.quote.iter().copied());
        }
        if set.is_empty() {
            return fallback(&self.special);
        }
        set
    }

    fn value_preferred_for_object(&mut self) -> FxHashSet<TokenId> {
        let Some(node_key) = self.current_node else { return FxHashSet::default() };
        let Some(key) = self.confirmed_key.clone() else { return FxHashSet::default() };
        let Some(child_key) = self.arena.get(node_key).and_then(|n| n.properties.get(&key).copied()) else {
            return FxHashSet::default();
        };
        let Some(child) = self.arena.get(child_key) else { return FxHashSet::default() };
        let (kind, enum_values) = (child.kind, child.enum_values.clone());
        self.preferred_for(kind, enum_values.as_deref())
    }

    fn value_preferred_for_array(&mut self) -> FxHashSet<TokenId> {
        let Some(item_key) = self.current_array_item_schema else { return FxHashSet::default() };
        let Some(item) = self.arena.get(item_key) else { return FxHashSet::default() };
        let (kind, enum_values) = (item.kind, item.enum_values.clone());
        self.preferred_for(kind, enum_values.as_deref())
    }

    fn preferred_for(&mut self, kind: SchemaKind, enum_values: Option<&[String]>) -> FxHashSet<TokenId> {
        match kind {
            SchemaKind::String => {
                let mut set: FxHashSet<TokenId> = self.special.quote.iter().copied().collect();
                if let Some(values) = enum_values {
                    for value in values {
                        if let Some(&first) = self.tokenizer.encode(&format!("\"{value}")).first() {
                            set.insert(first);
                        }
                    }
                }
                set
            }
            SchemaKind::Number => {
                const DIGIT_CHARS: &[char] =
                    &['-', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
                self.tokens_matching("number-digits", DIGIT_CHARS).iter().copied().collect()
            }
            SchemaKind::Boolean => {
                let mut set: FxHashSet<TokenId> = self.tokens_containing("bool-true", "true").iter().copied().collect();
                set.extend(self.tokens_containing("bool-false", "false").iter().copied());
                set
            }
            SchemaKind::Null => self.tokens_containing("null", "null").iter().copied().collect(),
            SchemaKind::Object => self.special.brace_open.iter().copied().collect(),
            SchemaKind::Array => self.special.bracket_open.iter().copied().collect(),
            SchemaKind::Any => FxHashSet::default(),
        }
    }

    fn tokens_matching(&mut self, cache_key: &str, chars: &[char]) -> Arc<[TokenId]> {
        if let Some(hit) = self.token_search_cache.get(cache_key) {
            return hit.clone();
        }
        let vocab_size = self.tokenizer.vocab_size().unwrap_or(0);
        let limit = vocab_size.min(self.config.search_limit);
        let mut ids = Vec::new();
        for id in 0..limit as TokenId {
            let text = self.tokenizer.decode_token(id);
            if text.chars().any(|c| chars.contains(&c)) {
                ids.push(id);
            }
        }
        let arc: Arc<[TokenId]> = ids.into();
        self.token_search_cache.insert(cache_key.to_string(), arc.clone());
        arc
    }

    fn tokens_containing(&mut self, cache_key: &str, needle: &str) -> Arc<[TokenId]> {
        if let Some(hit) = self.token_search_cache.get(cache_key) {
            return hit.clone();
        }
        let vocab_size = self.tokenizer.vocab_size().unwrap_or(0);
        let limit = vocab_size.min(self.config.search_limit);
        let mut ids = Vec::new();
        for id in 0..limit as TokenId {
            let text = self.tokenizer.decode_token(id);
            if text.contains(needle) {
                ids.push(id);
            }
        }
        let arc: Arc<[TokenId]> = ids.into();
        self.token_search_cache.insert(cache_key.to_string(), arc.clone());
        arc
    }
}
