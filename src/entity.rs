use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, Version, metadata::RESERVED_PREFIX};

const MAX_KEY_LEN: usize = 1024;

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Property {
    /// UTF-8 text.
    String(String),
    /// A signed 64-bit integer.
    Int64(i64),
    /// A double precision float.
    Double(f64),
    /// A boolean.
    Bool(bool),
    /// Opaque bytes.
    Binary(Vec<u8>),
}

impl Property {
    /// Returns the text if this is a `String` property.
    pub fn as_str(&self) -> Option<&str> {
        if let Property::String(s) = self { Some(s) } else { None }
    }

    /// Returns the integer if this is an `Int64` property.
    pub fn as_i64(&self) -> Option<i64> {
        if let Property::Int64(i) = self { Some(*i) } else { None }
    }

    /// Returns the flag if this is a `Bool` property.
    pub fn as_bool(&self) -> Option<bool> {
        if let Property::Bool(b) = self { Some(*b) } else { None }
    }
}

impl From<&str> for Property {
    fn from(s: &str) -> Property {
        Property::String(s.to_owned())
    }
}

impl From<String> for Property {
    fn from(s: String) -> Property {
        Property::String(s)
    }
}

impl From<i64> for Property {
    fn from(i: i64) -> Property {
        Property::Int64(i)
    }
}

impl From<f64> for Property {
    fn from(d: f64) -> Property {
        Property::Double(d)
    }
}

impl From<bool> for Property {
    fn from(b: bool) -> Property {
        Property::Bool(b)
    }
}

impl From<Vec<u8>> for Property {
    fn from(b: Vec<u8>) -> Property {
        Property::Binary(b)
    }
}

/// Named columns of a row, ordered by name.
pub type Properties = BTreeMap<String, Property>;

/// The primary key of a row: a partition key plus a row key.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct RowKey {
    /// Groups rows; queries are scoped to one partition.
    pub partition_key: String,
    /// Identifies the row within its partition.
    pub row_key: String,
}

impl RowKey {
    /// Creates a new `RowKey`. Validation happens when the key is
    /// used, see `RowKey::validate`.
    pub fn new<P: Into<String>, R: Into<String>>(
        partition_key: P,
        row_key: R,
    ) -> RowKey {
        RowKey { partition_key: partition_key.into(), row_key: row_key.into() }
    }

    /// Checks both components against the character rules shared by
    /// every backing store: no `/`, `\`, `#`, `?` or control
    /// characters, and at most 1024 bytes each.
    pub fn validate(&self) -> Result<()> {
        validate_key_component("partition key", &self.partition_key)?;
        validate_key_component("row key", &self.row_key)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.partition_key, self.row_key)
    }
}

fn validate_key_component(what: &str, component: &str) -> Result<()> {
    if component.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKey(format!(
            "{} is {} bytes, the limit is {}",
            what,
            component.len(),
            MAX_KEY_LEN
        )));
    }

    if let Some(c) = component.chars().find(|c| !is_valid_key_char(*c)) {
        return Err(Error::InvalidKey(format!(
            "{} {:?} contains forbidden character {:?}",
            what, component, c
        )));
    }

    Ok(())
}

fn is_valid_key_char(c: char) -> bool {
    !matches!(c, '/' | '\\' | '#' | '?') && !c.is_control()
}

/// A row as seen by callers: key, user columns, and the logical
/// version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// The row's primary key.
    pub key: RowKey,
    /// User columns. Names starting with `_rtable_` are rejected.
    pub properties: Properties,
    /// Set on entities returned by reads, usable as an expected
    /// version for a later conditional write.
    pub version: Option<Version>,
}

impl Entity {
    /// Creates an entity with no columns.
    pub fn new<P: Into<String>, R: Into<String>>(
        partition_key: P,
        row_key: R,
    ) -> Entity {
        Entity {
            key: RowKey::new(partition_key, row_key),
            properties: Properties::new(),
            version: None,
        }
    }

    /// Adds or overwrites a column.
    pub fn with<N: Into<String>, V: Into<Property>>(
        mut self,
        name: N,
        value: V,
    ) -> Entity {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Returns a column by name.
    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// The partition key.
    pub fn partition_key(&self) -> &str {
        &self.key.partition_key
    }

    /// The row key.
    pub fn row_key(&self) -> &str {
        &self.key.row_key
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.key.validate()?;
        if let Some(name) =
            self.properties.keys().find(|name| name.starts_with(RESERVED_PREFIX))
        {
            return Err(Error::ReservedColumn(name.clone()));
        }
        Ok(())
    }
}
