//! Replication metadata carried inside every replicated row.
//!
//! The metadata travels as ordinary columns in the reserved `_rtable_`
//! namespace, so any store that can hold typed columns can hold a
//! replica. A row without those columns has never been touched by the
//! replication layer, which is how rows of an unconverted table look.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Properties, Property, Result, RowKey};

pub(crate) const RESERVED_PREFIX: &str = "_rtable_";

pub(crate) const VIEW_ID_COLUMN: &str = "_rtable_ViewId";
pub(crate) const TOMBSTONE_COLUMN: &str = "_rtable_Tombstone";
pub(crate) const OPERATION_COLUMN: &str = "_rtable_Operation";
pub(crate) const COMMIT_BITMAP_COLUMN: &str = "_rtable_CommitBitmap";
pub(crate) const VERSION_COLUMN: &str = "_rtable_Version";

/// The most replicas a view can hold, one per commit bitmap bit.
pub const MAX_REPLICAS: usize = 64;

/// The largest view id or version a row can carry. Both are stored in
/// signed 64-bit columns.
pub const MAX_COUNTER: u64 = i64::MAX as u64;

/// Identifies a published view. Strictly increases with every
/// configuration change.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct ViewId(pub u64);

impl ViewId {
    pub(crate) fn next(self) -> ViewId {
        ViewId(self.0 + 1)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view {}", self.0)
    }
}

/// The logical version of a row. Every committed write bumps it by
/// one, and it is identical on every replica holding that write.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Version(pub u64);

impl Version {
    /// The version the next write of the row is stamped with.
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The kind of the last write applied to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// The row was created.
    Insert,
    /// The row's columns were overwritten.
    Replace,
    /// The row's columns were merged with new ones.
    Merge,
    /// The row was deleted and is now a tombstone.
    Delete,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Insert => "Insert",
            Operation::Replace => "Replace",
            Operation::Merge => "Merge",
            Operation::Delete => "Delete",
        }
    }

    fn parse(s: &str) -> Option<Operation> {
        Some(match s {
            "Insert" => Operation::Insert,
            "Replace" => Operation::Replace,
            "Merge" => Operation::Merge,
            "Delete" => Operation::Delete,
            _ => return None,
        })
    }
}

/// Which positions of a view have acknowledged a row's latest write.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitBitmap(u64);

impl CommitBitmap {
    /// A bitmap with only `position` set.
    pub fn single(position: usize) -> CommitBitmap {
        CommitBitmap::default().with(position)
    }

    /// Returns a copy with `position` set.
    pub fn with(self, position: usize) -> CommitBitmap {
        assert!(position < MAX_REPLICAS);
        CommitBitmap(self.0 | (1 << position))
    }

    /// Whether `position` has acknowledged.
    pub fn contains(&self, position: usize) -> bool {
        position < MAX_REPLICAS && self.0 & (1 << position) != 0
    }

    /// Whether every position set in `other` is also set here.
    pub fn covers(&self, other: CommitBitmap) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw bits, position 0 in the lowest bit.
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Iterates over the set positions in ascending order.
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_REPLICAS).filter(move |p| self.contains(*p))
    }
}

/// The replication state of one copy of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationMetadata {
    /// The view the bitmap positions refer to.
    pub view_id: ViewId,
    /// Whether the row is logically deleted.
    pub tombstone: bool,
    /// The last write applied.
    pub last_operation: Operation,
    /// Positions of `view_id` that acknowledged `version`.
    pub commit_bitmap: CommitBitmap,
    /// The logical version of this copy.
    pub version: Version,
}

impl ReplicationMetadata {
    /// Reads the reserved columns of a row. Returns `None` for a row
    /// carrying none of them, and `Error::Corruption` for a row that
    /// carries some but not all, or carries them with the wrong types.
    pub fn read(
        key: &RowKey,
        properties: &Properties,
    ) -> Result<Option<ReplicationMetadata>> {
        if !properties.keys().any(|name| name.starts_with(RESERVED_PREFIX)) {
            return Ok(None);
        }

        let corrupt = |reason: String| Error::Corruption {
            key: key.clone(),
            reason,
        };

        let int = |column: &str| -> Result<i64> {
            match properties.get(column) {
                Some(Property::Int64(i)) => Ok(*i),
                Some(other) => Err(corrupt(format!(
                    "{} has unexpected value {:?}",
                    column, other
                ))),
                None => Err(corrupt(format!("{} is missing", column))),
            }
        };

        let non_negative = |column: &str| -> Result<u64> {
            let i = int(column)?;
            u64::try_from(i)
                .map_err(|_| corrupt(format!("{} is negative: {}", column, i)))
        };

        let tombstone = match properties.get(TOMBSTONE_COLUMN) {
            Some(Property::Bool(b)) => *b,
            other => {
                return Err(corrupt(format!(
                    "{} has unexpected value {:?}",
                    TOMBSTONE_COLUMN, other
                )));
            }
        };

        let last_operation = match properties.get(OPERATION_COLUMN) {
            Some(Property::String(s)) => Operation::parse(s).ok_or_else(|| {
                corrupt(format!("unknown operation {:?}", s))
            })?,
            other => {
                return Err(corrupt(format!(
                    "{} has unexpected value {:?}",
                    OPERATION_COLUMN, other
                )));
            }
        };

        Ok(Some(ReplicationMetadata {
            view_id: ViewId(non_negative(VIEW_ID_COLUMN)?),
            tombstone,
            last_operation,
            // the bitmap uses all 64 bits, so it round trips through
            // the sign bit rather than being range checked
            commit_bitmap: CommitBitmap(int(COMMIT_BITMAP_COLUMN)? as u64),
            version: Version(non_negative(VERSION_COLUMN)?),
        }))
    }

    /// Writes this metadata into the reserved columns of `properties`,
    /// overwriting any previous metadata. The view id and version must
    /// not exceed `MAX_COUNTER`; published views and writes are checked
    /// against it before metadata is stamped.
    pub fn write_into(&self, properties: &mut Properties) {
        debug_assert!(self.view_id.0 <= MAX_COUNTER && self.version.0 <= MAX_COUNTER);
        properties
            .insert(VIEW_ID_COLUMN.into(), Property::Int64(self.view_id.0 as i64));
        properties
            .insert(TOMBSTONE_COLUMN.into(), Property::Bool(self.tombstone));
        properties.insert(
            OPERATION_COLUMN.into(),
            Property::String(self.last_operation.as_str().into()),
        );
        properties.insert(
            COMMIT_BITMAP_COLUMN.into(),
            Property::Int64(self.commit_bitmap.0 as i64),
        );
        properties
            .insert(VERSION_COLUMN.into(), Property::Int64(self.version.0 as i64));
    }
}

/// Strips the reserved columns, leaving only user columns.
pub(crate) fn user_columns(properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(name, _)| !name.starts_with(RESERVED_PREFIX))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
