use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Properties, RowKey};

/// Names a replica in views and in the `ReplicaRegistry`.
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
pub struct ReplicaId(pub String);

impl ReplicaId {
    /// Creates a new `ReplicaId`.
    pub fn new<S: Into<String>>(name: S) -> ReplicaId {
        ReplicaId(name.into())
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> ReplicaId {
        ReplicaId(s.to_owned())
    }
}

impl From<String> for ReplicaId {
    fn from(s: String) -> ReplicaId {
        ReplicaId(s)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque token that changes on every write to a row in one store.
/// Each replica assigns its own, so they are never compared across
/// replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(pub String);

/// A row as held by one store, with that store's `ETag`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub key: RowKey,
    pub properties: Properties,
    pub etag: ETag,
}

/// One page of a store scan, in key order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub rows: Vec<TableRow>,
    /// Pass back as `after` to fetch the next page. `None` once the
    /// scan is exhausted.
    pub continuation: Option<RowKey>,
}

/// How a single store call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The row's `ETag` did not match the expected one.
    PreconditionFailed,
    /// An insert found the row already present.
    AlreadyExists,
    /// A conditional replace found no row at all.
    NotFound,
    /// The store could not be contacted. Nothing was applied.
    Unreachable(String),
    /// The call timed out and may or may not have been applied.
    Timeout,
}

impl StoreError {
    /// Whether the call might succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unreachable(_) | StoreError::Timeout)
    }

    /// Converts a failure of the head replica into a caller-facing
    /// error. Failures of other replicas never reach callers.
    pub(crate) fn at_head(self, head: &ReplicaId, key: &RowKey) -> Error {
        match self {
            StoreError::PreconditionFailed | StoreError::AlreadyExists => {
                Error::precondition(key)
            }
            StoreError::NotFound => Error::not_found(key),
            StoreError::Unreachable(why) => {
                log::debug!("head {} unreachable: {}", head, why);
                Error::ReplicaUnreachable(head.clone())
            }
            StoreError::Timeout => Error::Unresolved(head.clone()),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::PreconditionFailed => f.write_str("etag mismatch"),
            StoreError::AlreadyExists => f.write_str("row already exists"),
            StoreError::NotFound => f.write_str("row not found"),
            StoreError::Unreachable(why) => write!(f, "unreachable: {}", why),
            StoreError::Timeout => f.write_str("timed out"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The result of a single store call.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One independent table store acting as a replica.
///
/// The replication layer only needs single-row conditional writes and
/// ordered paged scans. Every call may fail transiently, and no two
/// stores share any coordination.
pub trait ReplicaStore: Send + Sync + fmt::Debug {
    /// The name this store is registered under.
    fn id(&self) -> &ReplicaId;

    /// Reads one row.
    fn get(&self, key: &RowKey) -> StoreResult<Option<TableRow>>;

    /// Creates a row, failing with `AlreadyExists` if it is present.
    fn insert(&self, key: &RowKey, properties: Properties) -> StoreResult<ETag>;

    /// Overwrites a row if its current `ETag` equals `expected`.
    fn replace(
        &self,
        key: &RowKey,
        properties: Properties,
        expected: &ETag,
    ) -> StoreResult<ETag>;

    /// Scans rows in key order, starting strictly after `after`, limited
    /// to one partition when `partition` is set.
    fn query(
        &self,
        partition: Option<&str>,
        after: Option<&RowKey>,
        limit: usize,
    ) -> StoreResult<Page>;
}
