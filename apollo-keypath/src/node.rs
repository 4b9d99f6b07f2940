//! Structured configuration tree

use crate::path::{parse, KeyPath, PathSegment};
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// A node of an assembled namespace.
///
/// Leaves keep the raw string from the configuration service; interpreting
/// them (numbers, booleans, JSON literals) is left to the consumer, see
/// [`from_node`](crate::from_node).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigNode {
    /// Mapping in first-insertion order
    Map(IndexMap<String, ConfigNode>),
    /// Sequence in index order
    Seq(Vec<ConfigNode>),
    /// Raw string value
    Leaf(String),
    /// Sequence slot that no key ever filled
    #[default]
    Unset,
}

/// The root of an assembled namespace (always a [`ConfigNode::Map`]).
pub type StructuredConfig = ConfigNode;

/// Shape of a [`ConfigNode`], used when reporting conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Map,
    Seq,
    Leaf,
    Unset,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeKind::Map => "mapping",
            NodeKind::Seq => "sequence",
            NodeKind::Leaf => "value",
            NodeKind::Unset => "unset slot",
        })
    }
}

impl ConfigNode {
    pub fn empty_map() -> Self {
        ConfigNode::Map(IndexMap::new())
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            ConfigNode::Map(_) => NodeKind::Map,
            ConfigNode::Seq(_) => NodeKind::Seq,
            ConfigNode::Leaf(_) => NodeKind::Leaf,
            ConfigNode::Unset => NodeKind::Unset,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, ConfigNode::Unset)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigNode::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, ConfigNode>> {
        match self {
            ConfigNode::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[ConfigNode]> {
        match self {
            ConfigNode::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// Walk `path` from this node.
    pub fn get(&self, path: &KeyPath) -> Option<&ConfigNode> {
        let mut node = self;
        for segment in path.segments() {
            node = match (segment, node) {
                (PathSegment::Field(name), ConfigNode::Map(map)) => map.get(name)?,
                (PathSegment::Index(index), ConfigNode::Seq(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Look up a flat key (`a.bb[0]`) in this tree.
    ///
    /// Returns `None` for malformed keys as well as absent ones.
    pub fn lookup(&self, key: &str) -> Option<&ConfigNode> {
        let path = parse(key).ok()?;
        self.get(&path)
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            ConfigNode::Map(map) => map.values().map(ConfigNode::leaf_count).sum(),
            ConfigNode::Seq(items) => items.iter().map(ConfigNode::leaf_count).sum(),
            ConfigNode::Leaf(_) => 1,
            ConfigNode::Unset => 0,
        }
    }

    /// Convert into a JSON value; leaves stay strings and unset slots become
    /// `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigNode::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            ConfigNode::Seq(items) => {
                serde_json::Value::Array(items.iter().map(ConfigNode::to_json).collect())
            }
            ConfigNode::Leaf(value) => serde_json::Value::String(value.clone()),
            ConfigNode::Unset => serde_json::Value::Null,
        }
    }
}

impl Serialize for ConfigNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfigNode::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
            ConfigNode::Seq(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(item)?;
                }
                out.end()
            }
            ConfigNode::Leaf(value) => serializer.serialize_str(value),
            ConfigNode::Unset => serializer.serialize_none(),
        }
    }
}

impl From<&str> for ConfigNode {
    fn from(value: &str) -> Self {
        ConfigNode::Leaf(value.to_string())
    }
}

impl From<String> for ConfigNode {
    fn from(value: String) -> Self {
        ConfigNode::Leaf(value)
    }
}

/// Convert a decoded JSON value into a tree, stringifying scalars so they go
/// through the same coercion as values that arrived as flat strings.
pub(crate) fn from_json(value: serde_json::Value) -> ConfigNode {
    match value {
        serde_json::Value::Null => ConfigNode::Unset,
        serde_json::Value::Bool(b) => ConfigNode::Leaf(b.to_string()),
        serde_json::Value::Number(n) => ConfigNode::Leaf(n.to_string()),
        serde_json::Value::String(s) => ConfigNode::Leaf(s),
        serde_json::Value::Array(items) => {
            ConfigNode::Seq(items.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(map) => ConfigNode::Map(
            map.into_iter()
                .map(|(key, value)| (key, from_json(value)))
                .collect(),
        ),
    }
}
