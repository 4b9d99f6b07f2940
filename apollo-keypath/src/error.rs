//! Error types for key parsing and namespace assembly

use thiserror::Error;

/// A flat key that cannot be turned into a [`KeyPath`](crate::KeyPath).
///
/// These always point at an authoring mistake on the configuration service;
/// they are surfaced to the caller and never repaired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyPathError {
    #[error("Empty key")]
    Empty,

    #[error("Empty segment {position} in key '{key}'")]
    EmptySegment { key: String, position: usize },

    #[error("Missing field name before '[' in key '{key}'")]
    MissingName { key: String },

    #[error("Unbalanced bracket in key '{key}'")]
    UnbalancedBracket { key: String },

    #[error("Unexpected text after ']' in key '{key}'")]
    TrailingText { key: String },

    #[error("Invalid index '{index}' in key '{key}'")]
    InvalidIndex { key: String, index: String },

    #[error("Index {index} in key '{key}' exceeds the maximum of {max}")]
    IndexOutOfRange { key: String, index: usize, max: usize },
}

/// Failure to assemble a namespace into a structured tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("Malformed key: {0}")]
    MalformedKey(#[from] KeyPathError),

    /// The same field is expressed both with bracket indices (`arr[0]`) and as
    /// a JSON array literal (`arr = [..]`). Neither form takes precedence.
    #[error("Field '{field}' is given both as an indexed sequence and as a JSON array literal")]
    AmbiguousSequence { field: String },
}
