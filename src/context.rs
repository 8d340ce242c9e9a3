//! Processor-side context stack: parallel to the DPDA's container stack, but
//! carrying schema context instead of bare container kind.
//!
//! Invariant: the top of this stack always matches the top of the DPDA
//! stack's container type — an [`crate::dpda::ContainerFrame::Object`]
//! corresponds to [`ContextFrame::Object`] and likewise for arrays. Keeping
//! the two stacks in lockstep is the processor's responsibility; this type
//! only stores the schema-side payload.

use rustc_hash::FxHashSet;

use crate::schema::SchemaKey;

/// A single frame of schema context, pushed when the DPDA enters a container
/// and popped when it leaves one.
#[derive(Debug, Clone)]
pub enum ContextFrame {
    /// Inside a JSON object. `node` is `None` when the enclosing schema is
    /// `any` or the key that produced this object was unrecognized.
    Object {
        /// The schema node describing this object, if known.
        node: Option<SchemaKey>,
        /// The property keys allowed at this level (empty if `node` is `None`).
        allowed_keys: FxHashSet<String>,
    },
    /// Inside a JSON array.
    Array {
        /// The schema node describing this array's elements, if known.
        item_schema: Option<SchemaKey>,
    },
}

/// The processor-side context stack.
#[derive(Debug, Clone, Default)]
pub struct ContextStack {
    frames: Vec<ContextFrame>,
}

impl ContextStack {
    /// An empty context stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an object frame.
    pub fn push_object(&mut self, node: Option<SchemaKey>, allowed_keys: FxHashSet<String>) {
        self.frames.push(ContextFrame::Object { node, allowed_keys });
    }

    /// Push an array frame.
    pub fn push_array(&mut self, item_schema: Option<SchemaKey>) {
        self.frames.push(ContextFrame::Array { item_schema });
    }

    /// Pop the innermost frame, if any.
    pub fn pop(&mut self) -> Option<ContextFrame> {
        self.frames.pop()
    }

    /// The innermost frame, if any.
    #[must_use]
    pub fn top(&self) -> Option<&ContextFrame> {
        self.frames.last()
    }

    /// Current nesting depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the stack is empty (i.e. at the request root).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop all frames, returning to the request root.
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn push_pop_round_trips() {
        let mut keys: SlotMap<SchemaKey, ()> = SlotMap::with_key();
        let k = keys.insert(());

        let mut stack = ContextStack::new();
        assert!(stack.is_empty());

        stack.push_object(Some(k), FxHashSet::default());
        assert_eq!(stack.len(), 1);
        assert!(matches!(stack.top(), Some(ContextFrame::Object { node: Some(_), .. })));

        stack.push_array(None);
        assert_eq!(stack.len(), 2);
        assert!(matches!(stack.top(), Some(ContextFrame::Array { item_schema: None })));

        stack.pop();
        assert_eq!(stack.len(), 1);
        stack.pop();
        assert!(stack.is_empty());
        assert!(stack.pop().is_none());
    }

    #[test]
    fn clear_drops_all_frames() {
        let mut stack = ContextStack::new();
        stack.push_object(None, FxHashSet::default());
        stack.push_array(None);
        stack.clear();
        assert!(stack.is_empty());
    }
}
