//! Flat key parsing
//!
//! A key is split on `.` into field segments; each field may carry one or more
//! `[n]` suffixes selecting a sequence position:
//!
//! ```
//! use apollo_keypath::{parse, PathSegment};
//!
//! let path = parse("a.bb[0]").unwrap();
//! assert_eq!(
//!     path.segments(),
//!     &[
//!         PathSegment::Field("a".into()),
//!         PathSegment::Field("bb".into()),
//!         PathSegment::Index(0),
//!     ]
//! );
//! ```
//!
//! `.` is reserved as the separator, so field names containing a dot cannot
//! be expressed.

use crate::error::KeyPathError;
use std::fmt;
use std::str::FromStr;

/// Largest sequence index accepted in a key.
///
/// Gaps are materialized as unset slots, so an unbounded index would let a
/// single key allocate an arbitrarily large sequence.
pub const MAX_INDEX: usize = 65_535;

/// One step of a [`KeyPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Named entry of a mapping
    Field(String),
    /// Position in a sequence
    Index(usize),
}

impl PathSegment {
    pub fn is_index(&self) -> bool {
        matches!(self, PathSegment::Index(_))
    }
}

/// A parsed flat key.
///
/// Never empty, and always starts with a [`PathSegment::Field`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<PathSegment>);

impl KeyPath {
    /// Build a path from segments.
    ///
    /// Returns `None` for an empty list or one that starts with an index,
    /// neither of which a flat key can express.
    pub fn from_segments(segments: Vec<PathSegment>) -> Option<Self> {
        match segments.first() {
            Some(PathSegment::Field(_)) => Some(Self(segments)),
            _ => None,
        }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The top-level field this key writes under.
    pub fn root_field(&self) -> &str {
        match &self.0[0] {
            PathSegment::Field(name) => name,
            PathSegment::Index(_) => unreachable!("KeyPath always starts with a field"),
        }
    }

    /// `true` for a key without any `.` or `[]` structure.
    pub fn is_simple(&self) -> bool {
        self.0.len() == 1
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if i == 0 => f.write_str(name)?,
                PathSegment::Field(name) => write!(f, ".{}", name)?,
                PathSegment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl FromStr for KeyPath {
    type Err = KeyPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a flat key into a [`KeyPath`].
///
/// Index values are not checked against any existing sequence length; that is
/// the assembler's concern.
pub fn parse(key: &str) -> Result<KeyPath, KeyPathError> {
    if key.is_empty() {
        return Err(KeyPathError::Empty);
    }

    let mut segments = Vec::new();
    for (position, raw) in key.split('.').enumerate() {
        if raw.is_empty() {
            return Err(KeyPathError::EmptySegment {
                key: key.to_string(),
                position,
            });
        }

        let (name, mut rest) = match raw.find('[') {
            Some(open) => (&raw[..open], &raw[open..]),
            None => (raw, ""),
        };
        if name.contains(']') {
            return Err(KeyPathError::UnbalancedBracket {
                key: key.to_string(),
            });
        }
        if name.is_empty() {
            return Err(KeyPathError::MissingName {
                key: key.to_string(),
            });
        }
        segments.push(PathSegment::Field(name.to_string()));

        while !rest.is_empty() {
            let Some(inner) = rest.strip_prefix('[') else {
                return Err(KeyPathError::TrailingText {
                    key: key.to_string(),
                });
            };
            let Some(close) = inner.find(']') else {
                return Err(KeyPathError::UnbalancedBracket {
                    key: key.to_string(),
                });
            };
            let digits = &inner[..close];
            if digits.contains('[') {
                return Err(KeyPathError::UnbalancedBracket {
                    key: key.to_string(),
                });
            }
            segments.push(PathSegment::Index(parse_index(key, digits)?));
            rest = &inner[close + 1..];
        }
    }

    Ok(KeyPath(segments))
}

fn parse_index(key: &str, digits: &str) -> Result<usize, KeyPathError> {
    let invalid = || KeyPathError::InvalidIndex {
        key: key.to_string(),
        index: digits.to_string(),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let index: usize = digits.parse().map_err(|_| invalid())?;
    if index > MAX_INDEX {
        return Err(KeyPathError::IndexOutOfRange {
            key: key.to_string(),
            index,
            max: MAX_INDEX,
        });
    }
    Ok(index)
}
