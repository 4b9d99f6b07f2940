//! Flat map assembly
//!
//! Merges every `(key, value)` of a namespace into one [`ConfigNode`] tree.
//!
//! # Conflict policy
//!
//! Entries are applied in input order (the order the configuration service
//! returned them) and the later entry always wins:
//!
//! - a field applied where a sequence or value already sits, an index applied
//!   where a mapping or value sits, or a value written over a mapping or
//!   sequence replaces the existing node wholesale;
//! - a value written over a value (duplicate key) overwrites it.
//!
//! Each such event is reported as a [`StructuralConflict`] so callers can log
//! it. The one case that is rejected outright is a field expressed both as a
//! bracket-indexed sequence and as a JSON array literal, see
//! [`AssemblyError::AmbiguousSequence`].
//!
//! Sequence slots between indices that no key fills stay [`ConfigNode::Unset`].

use crate::error::AssemblyError;
use crate::node::{ConfigNode, NodeKind, StructuredConfig};
use crate::path::{parse, KeyPath, PathSegment};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;

/// Result of assembling one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub config: StructuredConfig,
    pub conflicts: Vec<StructuralConflict>,
}

/// How a later entry overrode an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The node had the wrong shape and was replaced
    Replaced { expected: NodeKind, found: NodeKind },
    /// The same key was written twice
    DuplicateKey,
}

/// A last-write-wins event recorded during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralConflict {
    /// The key whose write caused the conflict
    pub key: String,
    pub kind: ConflictKind,
}

impl fmt::Display for StructuralConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConflictKind::Replaced { expected, found } => write!(
                f,
                "key '{}' needs a {} but found a {}; earlier entries were discarded",
                self.key, expected, found
            ),
            ConflictKind::DuplicateKey => {
                write!(f, "key '{}' was written more than once", self.key)
            }
        }
    }
}

/// Parse and assemble raw `(key, value)` entries.
///
/// Fails on the first malformed key.
pub fn assemble_raw(entries: &[(String, String)]) -> Result<Assembly, AssemblyError> {
    let parsed = entries
        .iter()
        .map(|(key, value)| Ok((parse(key)?, value.clone())))
        .collect::<Result<Vec<_>, AssemblyError>>()?;
    assemble(parsed)
}

/// Assemble parsed entries into a tree. Deterministic for a given input order.
pub fn assemble<I>(entries: I) -> Result<Assembly, AssemblyError>
where
    I: IntoIterator<Item = (KeyPath, String)>,
{
    let mut root = ConfigNode::empty_map();
    let mut conflicts = Vec::new();
    let mut indexed_fields: HashSet<Vec<PathSegment>> = HashSet::new();
    let mut array_literals: HashSet<Vec<PathSegment>> = HashSet::new();

    for (path, value) in entries {
        let segments = path.segments();

        for (i, segment) in segments.iter().enumerate() {
            // Every prefix ending before an index is a sequence, nested ones included
            if segment.is_index() && i > 0 {
                let field = segments[..i].to_vec();
                if array_literals.contains(&field) {
                    return Err(ambiguous(field));
                }
                indexed_fields.insert(field);
            }
        }
        if is_json_array(&value) {
            let field = segments.to_vec();
            if indexed_fields.contains(&field) {
                return Err(ambiguous(field));
            }
            array_literals.insert(field);
        }

        insert(&mut root, &path, value, &mut conflicts);
    }

    Ok(Assembly {
        config: root,
        conflicts,
    })
}

fn ambiguous(field: Vec<PathSegment>) -> AssemblyError {
    let field = KeyPath::from_segments(field)
        .map(|path| path.to_string())
        .unwrap_or_default();
    AssemblyError::AmbiguousSequence { field }
}

fn is_json_array(value: &str) -> bool {
    value.trim_start().starts_with('[')
        && matches!(
            serde_json::from_str::<serde_json::Value>(value),
            Ok(serde_json::Value::Array(_))
        )
}

fn insert(
    root: &mut ConfigNode,
    path: &KeyPath,
    value: String,
    conflicts: &mut Vec<StructuralConflict>,
) {
    let mut node = root;
    for segment in path.segments() {
        node = match segment {
            PathSegment::Field(name) => ensure_map(node, path, conflicts)
                .entry(name.clone())
                .or_insert(ConfigNode::Unset),
            PathSegment::Index(index) => {
                let items = ensure_seq(node, path, conflicts);
                if items.len() <= *index {
                    items.resize(index + 1, ConfigNode::Unset);
                }
                &mut items[*index]
            }
        };
    }

    match node.kind() {
        NodeKind::Unset => {}
        NodeKind::Leaf => conflicts.push(StructuralConflict {
            key: path.to_string(),
            kind: ConflictKind::DuplicateKey,
        }),
        found => conflicts.push(StructuralConflict {
            key: path.to_string(),
            kind: ConflictKind::Replaced {
                expected: NodeKind::Leaf,
                found,
            },
        }),
    }
    *node = ConfigNode::Leaf(value);
}

fn reshape(
    node: &mut ConfigNode,
    expected: NodeKind,
    path: &KeyPath,
    conflicts: &mut Vec<StructuralConflict>,
) {
    let found = node.kind();
    if found == expected {
        return;
    }
    if found != NodeKind::Unset {
        conflicts.push(StructuralConflict {
            key: path.to_string(),
            kind: ConflictKind::Replaced { expected, found },
        });
    }
    *node = match expected {
        NodeKind::Seq => ConfigNode::Seq(Vec::new()),
        _ => ConfigNode::Map(IndexMap::new()),
    };
}

fn ensure_map<'a>(
    node: &'a mut ConfigNode,
    path: &KeyPath,
    conflicts: &mut Vec<StructuralConflict>,
) -> &'a mut IndexMap<String, ConfigNode> {
    reshape(node, NodeKind::Map, path, conflicts);
    match node {
        ConfigNode::Map(map) => map,
        _ => unreachable!("node was reshaped into a mapping"),
    }
}

fn ensure_seq<'a>(
    node: &'a mut ConfigNode,
    path: &KeyPath,
    conflicts: &mut Vec<StructuralConflict>,
) -> &'a mut Vec<ConfigNode> {
    reshape(node, NodeKind::Seq, path, conflicts);
    match node {
        ConfigNode::Seq(items) => items,
        _ => unreachable!("node was reshaped into a sequence"),
    }
}
