use std::{
    error::Error as StdError,
    fmt::{self, Display},
};

use crate::{ReplicaId, RowKey, Version, ViewId};

/// The top-level result type for dealing with an `RTable`.
pub type Result<T> = std::result::Result<T, Error>;

/// An Error type encapsulating various issues that may come up
/// in both the expected and unexpected operation of an `RTable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The row was changed since the caller observed it, or an
    /// insert found a live row already present.
    PreconditionFailed {
        /// The contended row.
        key: RowKey,
    },
    /// No live row exists for the key.
    NotFound {
        /// The missing row.
        key: RowKey,
    },
    /// The view changed while a write was in flight. The write
    /// committed at the head with `version`, but propagation was cut
    /// short to the replicas that remain active in `view_id`.
    ViewChanged {
        /// The logical version committed at the head.
        version: Version,
        /// The view that superseded the one the write started in.
        view_id: ViewId,
    },
    /// The head replica could not be reached. Tail failures are never
    /// surfaced this way; they become replication gaps instead.
    ReplicaUnreachable(ReplicaId),
    /// It is unknown whether a write took effect. Either the head
    /// timed out on it, or it committed at a head that a newer view
    /// retired and could not be carried to that view's head, named
    /// here.
    Unresolved(ReplicaId),
    /// The configuration source could not be read or written.
    ConfigUnavailable(String),
    /// A conditional configuration update lost a race.
    ConfigConflict {
        /// The view id the update was conditioned on.
        expected: Option<ViewId>,
        /// The view id that was actually published.
        actual: Option<ViewId>,
    },
    /// A row kept changing while conversion tried to stamp it.
    ConversionAborted {
        /// The row that could not be stamped.
        key: RowKey,
        /// How many stamping attempts were made.
        attempts: usize,
    },
    /// A partition or row key contains a forbidden character.
    InvalidKey(String),
    /// A user entity carries a column in the reserved namespace.
    ReservedColumn(String),
    /// A view or a requested reconfiguration is malformed.
    InvalidView(String),
    /// A row carries replication metadata that could not be decoded.
    Corruption {
        /// The row with damaged metadata.
        key: RowKey,
        /// What was wrong with it.
        reason: String,
    },
}

impl Error {
    pub(crate) fn precondition(key: &RowKey) -> Error {
        Error::PreconditionFailed { key: key.clone() }
    }

    pub(crate) fn not_found(key: &RowKey) -> Error {
        Error::NotFound { key: key.clone() }
    }
}

impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Error::*;

        match *self {
            PreconditionFailed { ref key } => {
                write!(f, "precondition failed for row {}", key)
            }
            NotFound { ref key } => write!(f, "row {} not found", key),
            ViewChanged { version, view_id } => write!(
                f,
                "view changed to {} while committing version {}",
                view_id, version
            ),
            ReplicaUnreachable(ref id) => {
                write!(f, "head replica {} is unreachable", id)
            }
            Unresolved(ref id) => write!(
                f,
                "write to head replica {} timed out with an unknown outcome",
                id
            ),
            ConfigUnavailable(ref why) => {
                write!(f, "view configuration unavailable: {}", why)
            }
            ConfigConflict { expected, actual } => write!(
                f,
                "view configuration conflict: expected {:?} but found {:?}",
                expected, actual
            ),
            ConversionAborted { ref key, attempts } => write!(
                f,
                "gave up converting row {} after {} attempts",
                key, attempts
            ),
            InvalidKey(ref why) => write!(f, "invalid key: {}", why),
            ReservedColumn(ref name) => {
                write!(f, "column {} is reserved for replication metadata", name)
            }
            InvalidView(ref why) => write!(f, "invalid view: {}", why),
            Corruption { ref key, ref reason } => write!(
                f,
                "corrupt replication metadata on row {}: {}",
                key, reason
            ),
        }
    }
}
