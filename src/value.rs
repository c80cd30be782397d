// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use serde::ser::Serializer;
use serde::Serialize;

use crate::artifact::ArtifactDescription;
use crate::hasher::{ContentHash, Hasher};
use crate::name::EntityName;
use crate::number::Number;

/// Serialization modes for [`Value::to_json`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonMode {
    /// Serialize all values, including target nodes in full.
    SerializeAll,
    /// Serialize all values, but represent target nodes by their identifier.
    SerializeAllButNodes,
    /// Replace values without a JSON representation by null.
    NullForNonJson,
}

/// The tagged value of the expression language.
///
/// Composite values are immutable and shared; cloning is cheap. Lists and
/// maps memoise their structural hash behind a one-shot slot, so concurrent
/// hash requests race only on who computes first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(Arc<str>),
    List(Arc<List>),
    Map(Arc<Map>),
    Artifact(Arc<ArtifactDescription>),
    Result(Arc<TargetResult>),
    Node(Arc<TargetNode>),
    Name(Arc<EntityName>),
}

/// An ordered sequence of values with a memoised structural hash.
#[derive(Debug, Default)]
pub struct List {
    items: Vec<Value>,
    hash: OnceLock<ContentHash>,
}

/// A string-keyed mapping with a memoised structural hash.
///
/// Keys iterate in sorted order, which makes every traversal deterministic.
#[derive(Debug, Default)]
pub struct Map {
    entries: BTreeMap<String, Value>,
    hash: OnceLock<ContentHash>,
}

/// The value a defining expression reduces to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetResult {
    pub artifacts: Value,
    pub runfiles: Value,
    pub provides: Value,
    pub is_cacheable: bool,
}

/// A node in a computed target graph: either an already-analysed result or
/// an abstract description still to be instantiated against a rule map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetNode {
    Value(Value),
    Abstract {
        node_type: String,
        string_fields: Value,
        target_fields: Value,
    },
}

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}
impl Eq for List {}

impl std::hash::Hash for List {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.items.hash(state);
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
impl Eq for Map {}

impl std::hash::Hash for Map {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.entries.hash(state);
    }
}

impl List {
    pub fn items(&self) -> &[Value] {
        &self.items
    }
}

impl Map {
    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }
}

impl TargetResult {
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "artifact_stage".into(),
            self.artifacts.to_json(JsonMode::SerializeAllButNodes),
        );
        obj.insert(
            "runfiles".into(),
            self.runfiles.to_json(JsonMode::SerializeAllButNodes),
        );
        obj.insert(
            "provides".into(),
            self.provides.to_json(JsonMode::SerializeAllButNodes),
        );
        serde_json::Value::Object(obj)
    }
}

impl TargetNode {
    pub fn is_cacheable(&self) -> bool {
        match self {
            TargetNode::Value(v) => v.is_cacheable(),
            TargetNode::Abstract {
                string_fields,
                target_fields,
                ..
            } => string_fields.is_cacheable() && target_fields.is_cacheable(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TargetNode::Value(v) => serde_json::json!({
                "type": "VALUE_NODE",
                "result": v.to_json(JsonMode::SerializeAll),
            }),
            TargetNode::Abstract {
                node_type,
                string_fields,
                target_fields,
            } => serde_json::json!({
                "type": "ABSTRACT_NODE",
                "node_type": node_type,
                "string_fields": string_fields.to_json(JsonMode::SerializeAll),
                "target_fields": target_fields.to_json(JsonMode::SerializeAll),
            }),
        }
    }
}

impl Value {
    pub fn empty_list() -> Value {
        Value::from(Vec::new())
    }

    pub fn empty_map() -> Value {
        Value::from(BTreeMap::new())
    }

    pub fn singleton_map(key: impl Into<String>, value: Value) -> Value {
        let mut m = BTreeMap::new();
        m.insert(key.into(), value);
        Value::from(m)
    }

    pub fn from_json_str(json: &str) -> Result<Value> {
        Ok(Value::from_json(&serde_json::from_str(json)?))
    }

    /// Total on valid JSON; numbers outside the finite range become null.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match Number::from_json(n) {
                Some(n) => Value::Number(n),
                None => Value::Null,
            },
            serde_json::Value::String(s) => Value::String(s.as_str().into()),
            serde_json::Value::Array(items) => {
                Value::from(items.iter().map(Value::from_json).collect::<Vec<_>>())
            }
            serde_json::Value::Object(entries) => Value::from(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect::<BTreeMap<_, _>>(),
            ),
        }
    }

    pub fn to_json(&self, mode: JsonMode) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::to_value(n).unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::List(list) => serde_json::Value::Array(
                list.items.iter().map(|item| item.to_json(mode)).collect(),
            ),
            Value::Map(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in &map.entries {
                    obj.insert(k.clone(), v.to_json(mode));
                }
                serde_json::Value::Object(obj)
            }
            Value::Artifact(a) if mode != JsonMode::NullForNonJson => a.to_json(),
            Value::Result(r) if mode != JsonMode::NullForNonJson => r.to_json(),
            Value::Node(n) => match mode {
                JsonMode::SerializeAll => n.to_json(),
                JsonMode::SerializeAllButNodes => serde_json::json!({
                    "type": "NODE",
                    "id": self.to_identifier(),
                }),
                JsonMode::NullForNonJson => serde_json::Value::Null,
            },
            Value::Name(n) if mode != JsonMode::NullForNonJson => n.to_json(),
            _ => serde_json::Value::Null,
        }
    }

    /// Compact, key-sorted JSON dump; the canonical form used for hashing.
    pub fn dump(&self) -> String {
        serde_json::to_string(&self.to_json(JsonMode::SerializeAll)).unwrap_or_default()
    }

    /// The structural hash of this value.
    ///
    /// Atoms hash their canonical serialisation prefixed by a variant sigil;
    /// lists and maps hash over their children's hashes, which makes the
    /// digest independent of map insertion order.
    pub fn to_hash(&self) -> ContentHash {
        match self {
            Value::List(list) => *list
                .hash
                .get_or_init(|| {
                    let mut hasher = Hasher::new();
                    hasher.update("[");
                    for item in &list.items {
                        hasher.update(item.to_hash().bytes());
                    }
                    hasher.finalize()
                }),
            Value::Map(map) => *map
                .hash
                .get_or_init(|| {
                    let mut hasher = Hasher::new();
                    hasher.update("{");
                    for (k, v) in &map.entries {
                        hasher.update(ContentHash::of(k).bytes());
                        hasher.update(v.to_hash().bytes());
                    }
                    hasher.finalize()
                }),
            _ => {
                let prefix = match self {
                    Value::Artifact(_) => "@",
                    Value::Result(_) => "=",
                    Value::Node(_) => "#",
                    Value::Name(_) => "$",
                    _ => "",
                };
                let mut hasher = Hasher::new();
                hasher.update(prefix);
                hasher.update(self.dump());
                hasher.finalize()
            }
        }
    }

    /// Hex form of the structural hash, used wherever an identifier has to
    /// appear in JSON.
    pub fn to_identifier(&self) -> String {
        self.to_hash().hex()
    }

    /// A value is cacheable unless it contains an entity name or any
    /// non-cacheable result or node anywhere in its structure.
    pub fn is_cacheable(&self) -> bool {
        match self {
            Value::Name(_) => false,
            Value::Result(r) => r.is_cacheable,
            Value::Node(n) => n.is_cacheable(),
            Value::List(list) => list.items.iter().all(Value::is_cacheable),
            Value::Map(map) => map.entries.values().all(Value::is_cacheable),
            _ => true,
        }
    }

    /// Truth value: null, false, zero, and empty strings, lists and maps
    /// count as false.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64() != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(list) => !list.items.is_empty(),
            Value::Map(map) => !map.entries.is_empty(),
            _ => true,
        }
    }

    pub fn type_string(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Artifact(_) => "artifact",
            Value::Result(_) => "result",
            Value::Node(_) => "node",
            Value::Name(_) => "name",
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Value::List(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    pub fn is_artifact(&self) -> bool {
        matches!(self, Value::Artifact(_))
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Value::Result(_))
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Value::Node(_))
    }

    pub fn is_name(&self) -> bool {
        matches!(self, Value::Name(_))
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(anyhow!("not a bool: {self}")),
        }
    }

    pub fn as_number(&self) -> Result<Number> {
        match self {
            Value::Number(n) => Ok(*n),
            _ => Err(anyhow!("not a number: {self}")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s.as_ref()),
            _ => Err(anyhow!("not a string: {self}")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(list) => Ok(&list.items),
            _ => Err(anyhow!("not a list: {self}")),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Ok(&map.entries),
            _ => Err(anyhow!("not a map: {self}")),
        }
    }

    pub fn as_artifact(&self) -> Result<&ArtifactDescription> {
        match self {
            Value::Artifact(a) => Ok(a),
            _ => Err(anyhow!("not an artifact: {self}")),
        }
    }

    pub fn as_result(&self) -> Result<&Arc<TargetResult>> {
        match self {
            Value::Result(r) => Ok(r),
            _ => Err(anyhow!("not a result: {self}")),
        }
    }

    pub fn as_node(&self) -> Result<&Arc<TargetNode>> {
        match self {
            Value::Node(n) => Ok(n),
            _ => Err(anyhow!("not a node: {self}")),
        }
    }

    pub fn as_name(&self) -> Result<&Arc<EntityName>> {
        match self {
            Value::Name(n) => Ok(n),
            _ => Err(anyhow!("not a name: {self}")),
        }
    }

    /// Map lookup returning `None` for absent keys and non-maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.entries.get(key),
            _ => None,
        }
    }

    /// Map lookup with a fallback for absent keys.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.get(key).unwrap_or(default)
    }

    /// Map indexing; absence is an expression type error.
    pub fn index(&self, key: &str) -> Result<&Value> {
        self.as_map()?
            .get(key)
            .ok_or_else(|| anyhow!("map does not contain key '{key}'"))
    }

    /// List indexing; out-of-bounds is an expression type error.
    pub fn at(&self, pos: usize) -> Result<&Value> {
        let items = self.as_list()?;
        items
            .get(pos)
            .ok_or_else(|| anyhow!("list pos '{pos}' is out of bounds"))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(Number::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.as_str().into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(Arc::new(List {
            items,
            hash: OnceLock::new(),
        }))
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(Arc::new(Map {
            entries,
            hash: OnceLock::new(),
        }))
    }
}

impl From<ArtifactDescription> for Value {
    fn from(a: ArtifactDescription) -> Self {
        Value::Artifact(Arc::new(a))
    }
}

impl From<TargetResult> for Value {
    fn from(r: TargetResult) -> Self {
        Value::Result(Arc::new(r))
    }
}

impl From<TargetNode> for Value {
    fn from(n: TargetNode) -> Self {
        Value::Node(Arc::new(n))
    }
}

impl From<EntityName> for Value {
    fn from(n: EntityName) -> Self {
        Value::Name(Arc::new(n))
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json(JsonMode::SerializeAll).serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}
