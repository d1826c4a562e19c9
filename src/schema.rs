//! # Settings Schema
//!
//! A schema names every key the store may hold, its type and its default.
//! Schemas are JSON files named `<schema_id>.json` and are looked up on a
//! search path, first match wins:
//!
//! ```text
//! {
//!   "id": "org.gnome.shell.extensions.desk-changer",
//!   "keys": [
//!     { "name": "interval", "type": "int", "default": 300, "min": 1 },
//!     { "name": "notifications", "type": "bool", "default": true }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;

/// The type of a schema key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    Int,
    Bool,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::String => write!(f, "string"),
            KeyType::Int => write!(f, "int"),
            KeyType::Bool => write!(f, "bool"),
        }
    }
}

/// A stored value. Serialized as a bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn key_type(&self) -> KeyType {
        match self {
            Value::Bool(_) => KeyType::Bool,
            Value::Int(_) => KeyType::Int,
            Value::Str(_) => KeyType::String,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Parses command-line text as a value of the given type.
    pub fn parse_as(key_type: KeyType, text: &str) -> Option<Value> {
        match key_type {
            KeyType::String => Some(Value::Str(text.to_string())),
            KeyType::Int => text.trim().parse().ok().map(Value::Int),
            KeyType::Bool => match text.trim() {
                "true" | "1" | "on" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "off" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// Rust types that can be read out of a [`Value`] of one fixed [`KeyType`].
pub trait FromValue: Sized {
    const KEY_TYPE: KeyType;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for bool {
    const KEY_TYPE: KeyType = KeyType::Bool;

    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for i64 {
    const KEY_TYPE: KeyType = KeyType::Int;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for String {
    const KEY_TYPE: KeyType = KeyType::String;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// One declared key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaKey {
    pub name: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub default: Value,
    /// Lower bound for `int` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    id: String,
    keys: Vec<SchemaKey>,
}

/// A loaded schema.
#[derive(Debug, Clone)]
pub struct Schema {
    id: String,
    path: PathBuf,
    keys: BTreeMap<String, SchemaKey>,
}

impl Schema {
    /// Looks `schema_id` up on `search_path` and loads it.
    ///
    /// Directories are tried in order. A file that does not parse, or whose
    /// `id` does not match, is skipped with a warning; a file that parses but
    /// declares a default of the wrong type is rejected outright.
    pub fn resolve(schema_id: &str, search_path: &[PathBuf]) -> Result<Self, StoreError> {
        for dir in search_path {
            let path = dir.join(format!("{schema_id}.json"));
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };

            let file: SchemaFile = match serde_json::from_str(&content) {
                Ok(f) => f,
                Err(e) => {
                    warn!("Skipping unparsable schema {}: {e}", path.display());
                    continue;
                }
            };

            if file.id != schema_id {
                warn!(
                    "Skipping {}: declares id '{}', wanted '{schema_id}'",
                    path.display(),
                    file.id
                );
                continue;
            }

            let schema = Self::from_keys(schema_id, path, file.keys)?;
            debug!("Loaded schema {schema_id} from {}", schema.path.display());
            return Ok(schema);
        }

        Err(StoreError::SchemaNotFound {
            id: schema_id.to_string(),
            searched: search_path.to_vec(),
        })
    }

    fn from_keys(id: &str, path: PathBuf, keys: Vec<SchemaKey>) -> Result<Self, StoreError> {
        let mut map = BTreeMap::new();
        for key in keys {
            if key.default.key_type() != key.key_type {
                return Err(StoreError::InvalidSchema {
                    id: id.to_string(),
                    reason: format!(
                        "default for '{}' is {}, declared {}",
                        key.name,
                        key.default.key_type(),
                        key.key_type
                    ),
                });
            }
            if map.insert(key.name.clone(), key).is_some() {
                return Err(StoreError::InvalidSchema {
                    id: id.to_string(),
                    reason: "duplicate key".to_string(),
                });
            }
        }

        Ok(Self {
            id: id.to_string(),
            path,
            keys: map,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The file this schema was loaded from.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn key(&self, name: &str) -> Result<&SchemaKey, StoreError> {
        self.keys
            .get(name)
            .ok_or_else(|| StoreError::UnknownKey(name.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &SchemaKey> {
        self.keys.values()
    }

    /// Validates a value about to be written to `name`.
    pub fn check(&self, name: &str, value: &Value) -> Result<(), StoreError> {
        let key = self.key(name)?;
        if value.key_type() != key.key_type {
            return Err(StoreError::TypeMismatch {
                key: name.to_string(),
                expected: key.key_type,
                actual: value.key_type(),
            });
        }
        if let (Value::Int(v), Some(min)) = (value, key.min) {
            if *v < min {
                return Err(StoreError::OutOfRange {
                    key: name.to_string(),
                    value: *v,
                    min,
                });
            }
        }
        Ok(())
    }
}
