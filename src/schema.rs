//! Schema model: a normalized JSON Schema tree stored in a flat arena.
//!
//! The tree is a pointer graph in the abstract model; here it is represented
//! as a `slotmap` arena so that node identity (used to key the trie index)
//! is a plain integer rather than a reference-counted pointer.

use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{SlotMap, new_key_type};

use crate::error::SchemaBuildError;

new_key_type! {
    /// Arena key identifying a [`SchemaNode`]. Doubles as the identity used
    /// to key `SchemaTrieIndex` entries for object-kind nodes.
    pub struct SchemaKey;
}

/// The tagged kind of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// A JSON object with a known (possibly empty) property set.
    Object,
    /// A JSON array; see [`SchemaNode::items`] for its element schema.
    Array,
    /// A JSON string.
    String,
    /// A JSON number (integer or float; the core does not distinguish).
    Number,
    /// A JSON boolean.
    Boolean,
    /// The JSON literal `null`.
    Null,
    /// No type constraint; disables key/element constraints for this node.
    Any,
}

/// A single node in the schema tree.
///
/// Invariant: a node with `kind == Object` has well-defined `properties`
/// (possibly empty); a node with `kind == Array` has `items` set, or `None`
/// meaning the element schema is `any`.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    /// The tagged kind of this node.
    pub kind: SchemaKind,
    /// Mapping from property key to the child node describing its schema.
    pub properties: FxHashMap<String, SchemaKey>,
    /// Keys that MUST appear in a conforming object.
    pub required: FxHashSet<String>,
    /// The element schema for an array node.
    pub items: Option<SchemaKey>,
    /// Closed set of literal string values, if the schema declared `enum`.
    ///
    /// Narrows the *preferred* token set for a string-kind leaf; it never
    /// gates the hard mask (see [`crate::processor`]).
    pub enum_values: Option<Vec<String>>,
}

impl SchemaNode {
    fn leaf(kind: SchemaKind) -> Self {
        Self {
            kind,
            properties: FxHashMap::default(),
            required: FxHashSet::default(),
            items: None,
            enum_values: None,
        }
    }

    /// Property keys, stable-sorted for canonicalization (cache-key hashing,
    /// deterministic trie construction order).
    #[must_use]
    pub fn object_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.properties.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

/// An arena of [`SchemaNode`]s plus the key of its root.
///
/// Built once per request from an input JSON Schema document; immutable
/// thereafter and safely shared by reference across threads.
#[derive(Debug, Clone)]
pub struct SchemaArena {
    nodes: SlotMap<SchemaKey, SchemaNode>,
    root: SchemaKey,
}

impl SchemaArena {
    /// Parse a JSON Schema document into a `SchemaArena`.
    ///
    /// Only `type`, `properties`, `required`, `items`, and (as a supplement)
    /// `enum` are honored; other fields are ignored. `$ref` is rejected —
    /// recursive or external references must be flattened upstream.
    pub fn build(schema: &serde_json::Value) -> Result<Self, SchemaBuildError> {
        let mut nodes = SlotMap::with_key();
        let root = Self::build_node(schema, &mut nodes)?;
        Ok(Self { nodes, root })
    }

    /// Derive a `SchemaArena` directly from a Rust type via `schemars`,
    /// rather than hand-writing the JSON Schema document.
    ///
    /// The ergonomic entry point for callers whose target shape is already a
    /// Rust struct/enum with `#[derive(JsonSchema)]`, rather than a schema
    /// document received over the wire.
    pub fn from_type<T: schemars::JsonSchema>() -> Result<Self, SchemaBuildError> {
        let schema = schemars::schema_for!(T);
        let value = serde_json::to_value(schema).map_err(|e| SchemaBuildError::DerivedSchemaFailed {
            type_name: std::any::type_name::<T>(),
            reason: e.to_string(),
        })?;
        Self::build(&value)
    }

    fn build_node(
        value: &serde_json::Value,
        nodes: &mut SlotMap<SchemaKey, SchemaNode>,
    ) -> Result<SchemaKey, SchemaBuildError> {
        let obj = value
            .as_object()
            .ok_or(SchemaBuildError::NotAnObject)?;

        if let Some(r) = obj.get("$ref").and_then(|v| v.as_str()) {
            return Err(SchemaBuildError::UnsupportedRef(r.to_string()));
        }

        let kind = match obj.get("type").and_then(|v| v.as_str()) {
            Some("object") => SchemaKind::Object,
            Some("array") => SchemaKind::Array,
            Some("string") => SchemaKind::String,
            Some("number" | "integer") => SchemaKind::Number,
            Some("boolean") => SchemaKind::Boolean,
            Some("null") => SchemaKind::Null,
            Some(other) => return Err(SchemaBuildError::UnrecognizedType(other.to_string())),
            None => SchemaKind::Any,
        };

        let mut node = SchemaNode::leaf(kind);

        if let Some(values) = obj.get("enum").and_then(|v| v.as_array()) {
            node.enum_values = Some(
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            );
        }

        if kind == SchemaKind::Object {
            if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
                for (key, child_schema) in props {
                    let child_key = Self::build_node(child_schema, nodes)?;
                    node.properties.insert(key.clone(), child_key);
                }
            }
            if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
                node.required = required
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }

        if kind == SchemaKind::Array
            && let Some(items_schema) = obj.get("items")
        {
            node.items = Some(Self::build_node(items_schema, nodes)?);
        }

        Ok(nodes.insert(node))
    }

    /// The arena-wide root node key.
    #[must_use]
    pub fn root(&self) -> SchemaKey {
        self.root
    }

    /// Look up a node by its arena key.
    #[must_use]
    pub fn get(&self, key: SchemaKey) -> Option<&SchemaNode> {
        self.nodes.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_flat_object() {
        let schema = json!({
            "type": "object",
            "properties": { "name": { "type": "string" } },
            "required": ["name"]
        });
        let arena = SchemaArena::build(&schema).unwrap();
        let root = arena.get(arena.root()).unwrap();
        assert_eq!(root.kind, SchemaKind::Object);
        assert_eq!(root.object_keys(), vec!["name"]);
        assert!(root.required.contains("name"));
    }

    #[test]
    fn builds_nested_object() {
        let schema = json!({
            "type": "object",
            "properties": {
                "addr": {
                    "type": "object",
                    "properties": { "city": { "type": "string" } }
                }
            }
        });
        let arena = SchemaArena::build(&schema).unwrap();
        let root = arena.get(arena.root()).unwrap();
        let addr_key = root.properties["addr"];
        let addr = arena.get(addr_key).unwrap();
        assert_eq!(addr.kind, SchemaKind::Object);
        assert_eq!(addr.object_keys(), vec!["city"]);
    }

    #[test]
    fn array_without_items_is_any() {
        let schema = json!({ "type": "array" });
        let arena = SchemaArena::build(&schema).unwrap();
        let root = arena.get(arena.root()).unwrap();
        assert_eq!(root.kind, SchemaKind::Array);
        assert!(root.items.is_none());
    }

    #[test]
    fn untyped_node_is_any() {
        let schema = json!({});
        let arena = SchemaArena::build(&schema).unwrap();
        let root = arena.get(arena.root()).unwrap();
        assert_eq!(root.kind, SchemaKind::Any);
    }

    #[test]
    fn unrecognized_type_fails() {
        let schema = json!({ "type": "tuple" });
        assert!(matches!(
            SchemaArena::build(&schema),
            Err(SchemaBuildError::UnrecognizedType(_))
        ));
    }

    #[test]
    fn ref_is_rejected() {
        let schema = json!({ "$ref": "#/definitions/Foo" });
        assert!(matches!(
            SchemaArena::build(&schema),
            Err(SchemaBuildError::UnsupportedRef(_))
        ));
    }

    #[test]
    fn from_type_derives_schema_from_rust_struct() {
        #[derive(serde::Serialize, schemars::JsonSchema)]
        struct Person {
            name: String,
            age: u32,
        }

        let arena = SchemaArena::from_type::<Person>().unwrap();
        let root = arena.get(arena.root()).unwrap();
        assert_eq!(root.kind, SchemaKind::Object);
        assert!(root.properties.contains_key("name"));
        assert!(root.properties.contains_key("age"));
    }

    #[test]
    fn enum_values_captured() {
        let schema = json!({ "type": "string", "enum": ["a", "b"] });
        let arena = SchemaArena::build(&schema).unwrap();
        let root = arena.get(arena.root()).unwrap();
        assert_eq!(root.enum_values.as_deref(), Some(&["a".to_string(), "b".to_string()][..]));
    }
}
