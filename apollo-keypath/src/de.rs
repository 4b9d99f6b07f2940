//! Lenient deserialization out of a [`ConfigNode`] tree
//!
//! Every leaf the configuration service hands out is a string. This
//! deserializer coerces leaves on demand, driven by the target type:
//!
//! - integers and floats are parsed from the string (surrounding whitespace
//!   ignored)
//! - booleans accept `true/false`, `1/0`, `yes/no` and `on/off`, case
//!   insensitively
//! - a sequence or map target accepts either an assembled node or a leaf
//!   holding a JSON array/object literal (`white_list = [1, 2, 3]`)
//! - `Option<T>` is `None` for unset sequence slots
//!
//! Errors carry the path of the offending node (`servers[1].port`).

use crate::node::{from_json, ConfigNode};
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, Deserializer, IntoDeserializer, MapAccess,
    SeqAccess, Visitor,
};
use std::fmt;

/// Path reported for errors at the tree root.
const ROOT: &str = "(root)";

/// A value in the tree does not fit the requested type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeError {
    /// Path of the node that failed, `(root)` for the top level
    pub path: String,
    pub message: String,
}

impl DeError {
    fn at(mut self, path: &str) -> Self {
        if self.path.is_empty() {
            self.path = if path.is_empty() {
                ROOT.to_string()
            } else {
                path.to_string()
            };
        }
        self
    }
}

impl fmt::Display for DeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for DeError {}

impl de::Error for DeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        DeError {
            path: String::new(),
            message: msg.to_string(),
        }
    }
}

/// Deserialize a typed value out of an assembled tree.
pub fn from_node<T: DeserializeOwned>(node: &ConfigNode) -> Result<T, DeError> {
    T::deserialize(NodeDeserializer::new(node, String::new())).map_err(|e| e.at(""))
}

struct NodeDeserializer<'a> {
    node: &'a ConfigNode,
    path: String,
}

impl<'a> NodeDeserializer<'a> {
    fn new(node: &'a ConfigNode, path: String) -> Self {
        Self { node, path }
    }

    fn error(&self, message: impl fmt::Display) -> DeError {
        DeError {
            path: String::new(),
            message: message.to_string(),
        }
        .at(&self.path)
    }

    fn mismatch(&self, expected: &str) -> DeError {
        if self.node.is_unset() {
            return self.error(format_args!("value is unset, expected {}", expected));
        }
        self.error(format_args!("expected {}, found {}", expected, self.node.kind()))
    }

    fn leaf(&self, expected: &str) -> Result<&'a str, DeError> {
        match self.node {
            ConfigNode::Leaf(value) => Ok(value),
            _ => Err(self.mismatch(expected)),
        }
    }

    /// A leaf holding a JSON literal of the requested shape, converted to a
    /// node so it can be walked like an assembled one.
    fn literal(&self, want_array: bool) -> Option<ConfigNode> {
        let ConfigNode::Leaf(value) = self.node else {
            return None;
        };
        match serde_json::from_str::<serde_json::Value>(value).ok()? {
            v @ serde_json::Value::Array(_) if want_array => Some(from_json(v)),
            v @ serde_json::Value::Object(_) if !want_array => Some(from_json(v)),
            _ => None,
        }
    }
}

macro_rules! deserialize_parsed {
    ($($method:ident => $visit:ident : $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
                let raw = self.leaf(stringify!($ty))?;
                let parsed: $ty = raw.trim().parse().map_err(|_| {
                    self.error(format_args!("invalid {} '{}'", stringify!($ty), raw))
                })?;
                visitor.$visit(parsed)
            }
        )*
    };
}

impl<'de, 'a> Deserializer<'de> for NodeDeserializer<'a> {
    type Error = DeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.node {
            ConfigNode::Map(_) => self.deserialize_map(visitor),
            ConfigNode::Seq(_) => self.deserialize_seq(visitor),
            ConfigNode::Unset => visitor.visit_unit(),
            ConfigNode::Leaf(value) => match serde_json::from_str::<serde_json::Value>(value) {
                Ok(v @ (serde_json::Value::Array(_) | serde_json::Value::Object(_))) => {
                    let node = from_json(v);
                    NodeDeserializer::new(&node, self.path.clone()).deserialize_any(visitor)
                }
                Ok(serde_json::Value::String(s)) => visitor.visit_string(s),
                Ok(v) => v.deserialize_any(visitor).map_err(|e| self.error(e)),
                Err(_) => visitor.visit_str(value),
            },
        }
    }

    deserialize_parsed! {
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_i128 => visit_i128: i128,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_u128 => visit_u128: u128,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        let raw = self.leaf("bool")?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => visitor.visit_bool(true),
            "false" | "0" | "no" | "off" => visitor.visit_bool(false),
            _ => Err(self.error(format_args!("invalid bool '{}'", raw))),
        }
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        let raw = self.leaf("char")?;
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => visitor.visit_char(c),
            _ => Err(self.error(format_args!("invalid char '{}'", raw))),
        }
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_str(self.leaf("string")?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_bytes(self.leaf("bytes")?.as_bytes())
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        if self.node.is_unset() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.node {
            ConfigNode::Unset => visitor.visit_unit(),
            ConfigNode::Leaf(value) if value.is_empty() => visitor.visit_unit(),
            _ => Err(self.mismatch("unit")),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.node {
            ConfigNode::Seq(items) => {
                let access = SeqAccessor {
                    items: items.iter().enumerate(),
                    path: &self.path,
                };
                visitor.visit_seq(access).map_err(|e| e.at(&self.path))
            }
            ConfigNode::Leaf(_) => match self.literal(true) {
                Some(node) => {
                    NodeDeserializer::new(&node, self.path.clone()).deserialize_seq(visitor)
                }
                None => Err(self.error("expected sequence, found value that is not a JSON array")),
            },
            _ => Err(self.mismatch("sequence")),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        match self.node {
            ConfigNode::Map(map) => {
                let access = MapAccessor {
                    entries: map.iter(),
                    pending: None,
                    path: &self.path,
                };
                visitor.visit_map(access).map_err(|e| e.at(&self.path))
            }
            ConfigNode::Leaf(_) => match self.literal(false) {
                Some(node) => {
                    NodeDeserializer::new(&node, self.path.clone()).deserialize_map(visitor)
                }
                None => Err(self.error("expected mapping, found value that is not a JSON object")),
            },
            _ => Err(self.mismatch("mapping")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DeError> {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DeError> {
        let raw = self.leaf("enum variant")?;
        visitor
            .visit_enum(raw.trim().into_deserializer())
            .map_err(|e: DeError| e.at(&self.path))
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DeError> {
        visitor.visit_unit()
    }
}

struct SeqAccessor<'a, I> {
    items: I,
    path: &'a str,
}

impl<'de, 'a, I> SeqAccess<'de> for SeqAccessor<'a, I>
where
    I: Iterator<Item = (usize, &'a ConfigNode)>,
{
    type Error = DeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, DeError> {
        match self.items.next() {
            Some((index, node)) => {
                let path = format!("{}[{}]", self.path, index);
                seed.deserialize(NodeDeserializer::new(node, path)).map(Some)
            }
            None => Ok(None),
        }
    }
}

struct MapAccessor<'a, I> {
    entries: I,
    pending: Option<(&'a String, &'a ConfigNode)>,
    path: &'a str,
}

impl<'a, I> MapAccessor<'a, I> {
    fn child_path(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }
}

impl<'de, 'a, I> MapAccess<'de> for MapAccessor<'a, I>
where
    I: Iterator<Item = (&'a String, &'a ConfigNode)>,
{
    type Error = DeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, DeError> {
        match self.entries.next() {
            Some((key, node)) => {
                self.pending = Some((key, node));
                let key_node = ConfigNode::Leaf(key.clone());
                seed.deserialize(NodeDeserializer::new(&key_node, self.child_path(key)))
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, DeError> {
        let Some((key, node)) = self.pending.take() else {
            return Err(de::Error::custom("value requested before key"));
        };
        seed.deserialize(NodeDeserializer::new(node, self.child_path(key)))
    }
}
