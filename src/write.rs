//! The write path: a conditional commit at the head, then sequential
//! propagation down the chain.
//!
//! Every replica only ever moves forward: a copy is overwritten only by
//! a strictly higher logical version, so writes racing down the chain
//! cannot regress a replica, and a retried or replayed write is a no-op.

use crate::{
    CommitBitmap, Config, Error, Operation, Properties, ReplicationMetadata,
    Result, RowKey, StoreError, StoreResult, Version, View, ViewId,
    ViewManager, ViewReplica,
    backoff::Backoff,
    metadata::{MAX_COUNTER, user_columns},
};

/// The version a conditional write expects the row to be at.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Apply unconditionally, as long as the row is live.
    #[default]
    Any,
    /// Apply only if the row is still at this version.
    Exactly(Version),
}

impl From<Version> for Expected {
    fn from(version: Version) -> Expected {
        Expected::Exactly(version)
    }
}

impl From<Option<Version>> for Expected {
    fn from(version: Option<Version>) -> Expected {
        version.map_or(Expected::Any, Expected::Exactly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Insert,
    Replace,
    Merge,
    Delete,
    InsertOrReplace,
    InsertOrMerge,
}

/// The outcome of a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    /// The logical version the row is now at.
    pub version: Version,
    /// The view the write was committed in.
    pub view_id: ViewId,
    /// Positions of that view that acknowledged the write.
    pub replicated: CommitBitmap,
    /// Whether every active replica acknowledged. When false, reads
    /// and background repair close the gap later.
    pub fully_replicated: bool,
}

/// The replication engine shared by every operation of an `RTable`.
pub(crate) struct Replicator {
    pub(crate) views: ViewManager,
    pub(crate) config: Config,
}

// The state of the head copy before a write, as the write sees it.
struct HeadState {
    live: Option<Version>,
    version: Version,
    user: Properties,
}

impl Replicator {
    pub(crate) fn execute(
        &self,
        kind: WriteKind,
        key: &RowKey,
        properties: Properties,
        expected: Expected,
    ) -> Result<CommitResult> {
        let view = self.views.current_view()?;
        let head = view.head();

        let current = head
            .store
            .get(key)
            .map_err(|e| e.at_head(head.id(), key))?;

        let state = match &current {
            None => HeadState {
                live: None,
                version: Version(0),
                user: Properties::new(),
            },
            Some(row) => {
                match ReplicationMetadata::read(key, &row.properties)? {
                    // never touched by replication, reads report it as v1
                    None => HeadState {
                        live: Some(Version(1)),
                        version: Version(1),
                        user: row.properties.clone(),
                    },
                    Some(meta) => HeadState {
                        live: (!meta.tombstone).then_some(meta.version),
                        version: meta.version,
                        user: user_columns(&row.properties),
                    },
                }
            }
        };

        if state.version.0 >= MAX_COUNTER {
            return Err(Error::Corruption {
                key: key.clone(),
                reason: format!("{} cannot be advanced", state.version),
            });
        }

        let check_expected = |live: Version| match expected {
            Expected::Exactly(v) if v != live => Err(Error::precondition(key)),
            _ => Ok(()),
        };

        let merged = |mut base: Properties, update: Properties| {
            base.extend(update);
            base
        };

        let (operation, tombstone, mut row_properties) = match kind {
            WriteKind::Insert => {
                if state.live.is_some() {
                    return Err(Error::precondition(key));
                }
                (Operation::Insert, false, properties)
            }
            WriteKind::Replace | WriteKind::Merge | WriteKind::Delete => {
                let live = state.live.ok_or_else(|| Error::not_found(key))?;
                check_expected(live)?;
                match kind {
                    WriteKind::Replace => (Operation::Replace, false, properties),
                    WriteKind::Merge => {
                        (Operation::Merge, false, merged(state.user, properties))
                    }
                    _ => (Operation::Delete, true, state.user),
                }
            }
            WriteKind::InsertOrReplace => match state.live {
                Some(_) => (Operation::Replace, false, properties),
                None => (Operation::Insert, false, properties),
            },
            WriteKind::InsertOrMerge => match state.live {
                Some(_) => {
                    (Operation::Merge, false, merged(state.user, properties))
                }
                None => (Operation::Insert, false, properties),
            },
        };

        let meta = ReplicationMetadata {
            view_id: view.id(),
            tombstone,
            last_operation: operation,
            commit_bitmap: CommitBitmap::single(head.position),
            version: state.version.next(),
        };
        meta.write_into(&mut row_properties);

        let head_write = match &current {
            None => head.store.insert(key, row_properties.clone()),
            Some(row) => {
                head.store.replace(key, row_properties.clone(), &row.etag)
            }
        };
        let head_etag = head_write.map_err(|e| match e {
            // the row was removed underneath us
            StoreError::NotFound => Error::precondition(key),
            other => other.at_head(head.id(), key),
        })?;

        log::trace!(
            "{:?} of {} committed {} at head {}",
            operation,
            key,
            meta.version,
            head.id()
        );

        let replicated = self.propagate(&view, key, &row_properties, meta);

        if replicated != meta.commit_bitmap {
            let mut head_properties = row_properties.clone();
            ReplicationMetadata { commit_bitmap: replicated, ..meta }
                .write_into(&mut head_properties);
            match head.store.replace(key, head_properties, &head_etag) {
                Ok(_) => {}
                Err(StoreError::PreconditionFailed | StoreError::NotFound) => {
                    log::trace!("{} of {} superseded before its bitmap was recorded", meta.version, key);
                }
                Err(e) => {
                    log::warn!(
                        "failed to record replication of {} for {} at head {}: {}",
                        meta.version,
                        key,
                        head.id(),
                        e
                    );
                }
            }
        }

        let latest = match self.views.refresh() {
            Ok(latest) => latest,
            Err(e) => {
                log::warn!("could not re-validate {} after writing {}: {}", view.id(), key, e);
                self.views.cached_view()
            }
        };

        if latest.id() != view.id() {
            log::debug!(
                "{} changed to {} while writing {}, repairing under the new view",
                view.id(),
                latest.id(),
                key
            );
            self.carry_into(&latest, key, row_properties, meta)?;
            return Err(Error::ViewChanged {
                version: meta.version,
                view_id: latest.id(),
            });
        }

        Ok(CommitResult {
            version: meta.version,
            view_id: view.id(),
            replicated,
            fully_replicated: replicated.covers(view.required()),
        })
    }

    /// Makes sure the head of `latest` holds `meta.version` of `key`
    /// or something newer, then repairs the row under `latest`.
    ///
    /// The head the write committed at may have left the chain in
    /// `latest`, so if the new head missed the write, the committed
    /// copy is replayed to it directly. If that fails the write only
    /// lives on a replica outside the chain and its outcome is
    /// `Error::Unresolved`.
    fn carry_into(
        &self,
        latest: &View,
        key: &RowKey,
        properties: Properties,
        meta: ReplicationMetadata,
    ) -> Result<()> {
        let held = match self.repair_key(latest, key) {
            Ok(repaired) => repaired.map(|repaired| repaired.meta.version),
            Err(e) => {
                log::warn!("repair of {} under {} failed: {}", key, latest.id(), e);
                None
            }
        };
        if held.is_some_and(|version| version >= meta.version) {
            return Ok(());
        }

        let head = latest.head();
        log::info!(
            "{} of {} is missing from {}, the head of {}, replaying it",
            meta.version,
            key,
            head.id(),
            latest.id()
        );

        let mut copy = properties;
        ReplicationMetadata {
            view_id: latest.id(),
            commit_bitmap: CommitBitmap::single(head.position),
            ..meta
        }
        .write_into(&mut copy);

        if let Err(e) = self.apply_if_newer(head, key, copy, meta.version) {
            log::warn!(
                "could not replay {} of {} to {}: {}",
                meta.version,
                key,
                head.id(),
                e
            );
            return Err(Error::Unresolved(head.id().clone()));
        }

        if let Err(e) = self.repair_key(latest, key) {
            log::warn!("repair of {} under {} failed: {}", key, latest.id(), e);
        }
        Ok(())
    }

    /// Pushes the head's copy down the chain in order, stopping at the
    /// first replica that cannot be brought up to date, and returns the
    /// positions that hold it. Replicas dropped by a newer view are
    /// skipped.
    fn propagate(
        &self,
        view: &View,
        key: &RowKey,
        properties: &Properties,
        meta: ReplicationMetadata,
    ) -> CommitBitmap {
        let mut replicated = meta.commit_bitmap;

        for replica in view.tails() {
            if replicated.contains(replica.position) {
                continue;
            }

            let latest = self.views.cached_view();
            if latest.id() != view.id() && latest.active(replica.id()).is_none()
            {
                log::debug!(
                    "not propagating {} to {}, it left the chain in {}",
                    key,
                    replica.id(),
                    latest.id()
                );
                continue;
            }

            let bitmap = replicated.with(replica.position);
            let mut copy = properties.clone();
            ReplicationMetadata { commit_bitmap: bitmap, ..meta }
                .write_into(&mut copy);

            match self.apply_if_newer(replica, key, copy, meta.version) {
                Ok(_) => replicated = bitmap,
                Err(e) => {
                    log::warn!(
                        "replica {} missed {} of {}: {}, leaving the rest of the chain to repair",
                        replica.id(),
                        meta.version,
                        key,
                        e
                    );
                    break;
                }
            }
        }

        replicated
    }

    /// Brings one replica's copy up to `version`, retrying transient
    /// failures and lost races with backoff. Returns whether the
    /// replica was written, `false` meaning it already held `version`
    /// or newer.
    pub(crate) fn apply_if_newer(
        &self,
        replica: ViewReplica<'_>,
        key: &RowKey,
        properties: Properties,
        version: Version,
    ) -> StoreResult<bool> {
        let backoff = Backoff::new(self.config.retry_backoff);
        let mut attempt = 0;

        loop {
            match try_apply(replica, key, &properties, version) {
                Ok(written) => return Ok(written),
                Err(e) if attempt >= self.config.propagation_retries => {
                    return Err(e);
                }
                Err(e) => {
                    log::trace!(
                        "attempt {} to bring {} of {} to {} failed: {}",
                        attempt,
                        key,
                        replica.id(),
                        version,
                        e
                    );
                    attempt += 1;
                    backoff.snooze();
                }
            }
        }
    }
}

fn try_apply(
    replica: ViewReplica<'_>,
    key: &RowKey,
    properties: &Properties,
    version: Version,
) -> StoreResult<bool> {
    let store = replica.store;

    let current = match store.get(key)? {
        None => return store.insert(key, properties.clone()).map(|_| true),
        Some(current) => current,
    };

    let theirs = match ReplicationMetadata::read(key, &current.properties) {
        Ok(Some(meta)) => meta.version,
        Ok(None) => Version(0),
        Err(e) => {
            log::warn!("overwriting damaged copy on {}: {}", replica.id(), e);
            Version(0)
        }
    };

    if theirs >= version {
        return Ok(false);
    }

    store
        .replace(key, properties.clone(), &current.etag)
        .map(|_| true)
}
