//! Flat-to-structured key mapping for Apollo namespaces
//!
//! Apollo stores every namespace as a flat list of `key = value` strings. Keys
//! may encode structure with dotted paths (`redis.port`) and bracketed array
//! indices (`hosts[0]`, `a.bb[1]`). This crate turns such a list into a nested
//! [`ConfigNode`] tree and deserializes typed settings out of it.
//!
//! # Architecture
//!
//! - [`path`]: parse one flat key into a [`KeyPath`]
//! - [`assemble`]: merge all keys of a namespace into one tree, with a
//!   last-write-wins conflict policy
//! - [`node`]: the tree itself (`Map | Seq | Leaf | Unset`)
//! - [`de`]: a lenient `serde` deserializer over the tree, coercing string
//!   leaves into numbers, booleans and JSON literals on demand
//! - [`error`]: error types
//!
//! This crate does no I/O; `apollo-sync` feeds it with data fetched from the
//! remote configuration service.

pub mod assemble;
pub mod de;
pub mod error;
pub mod node;
pub mod path;

pub use assemble::{assemble, assemble_raw, Assembly, ConflictKind, StructuralConflict};
pub use de::{from_node, DeError};
pub use error::{AssemblyError, KeyPathError};
pub use node::{ConfigNode, NodeKind, StructuredConfig};
pub use path::{parse, KeyPath, PathSegment, MAX_INDEX};
