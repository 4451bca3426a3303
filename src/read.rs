use std::sync::Arc;

use crate::{
    CommitBitmap, Entity, Error, Operation, ReplicaId, ReplicationMetadata,
    Result, RowKey, StoreError, TableRow, Version, View,
    metadata::user_columns, write::Replicator,
};

/// A head copy after repair.
pub(crate) struct Repaired {
    pub(crate) row: TableRow,
    pub(crate) meta: ReplicationMetadata,
    /// Positions of the view that hold the head's version.
    pub(crate) replicated: CommitBitmap,
    /// Whether any replica was behind.
    pub(crate) was_behind: bool,
    /// Whether every active replica now holds the head's version.
    pub(crate) complete: bool,
}

impl Repaired {
    pub(crate) fn into_entity(self) -> Entity {
        Entity {
            properties: user_columns(&self.row.properties),
            key: self.row.key,
            version: Some(self.meta.version),
        }
    }
}

fn scan_error(e: StoreError, head: &ReplicaId) -> Error {
    match e {
        StoreError::Timeout => Error::Unresolved(head.clone()),
        other => {
            log::debug!("scan of head {} failed: {}", head, other);
            Error::ReplicaUnreachable(head.clone())
        }
    }
}

impl Replicator {
    pub(crate) fn retrieve(&self, key: &RowKey) -> Result<Entity> {
        key.validate()?;
        let view = self.views.current_view()?;
        let head = view.head();

        let row = head
            .store
            .get(key)
            .map_err(|e| e.at_head(head.id(), key))?
            .ok_or_else(|| Error::not_found(key))?;

        let repaired = self.repair(&view, row)?;
        if repaired.meta.tombstone {
            return Err(Error::not_found(key));
        }
        Ok(repaired.into_entity())
    }

    /// Re-reads the head copy of `key` and repairs it under `view`.
    /// Returns `None` if the head holds no copy at all.
    pub(crate) fn repair_key(
        &self,
        view: &View,
        key: &RowKey,
    ) -> Result<Option<Repaired>> {
        let head = view.head();
        match head.store.get(key).map_err(|e| e.at_head(head.id(), key))? {
            Some(row) => self.repair(view, row).map(Some),
            None => Ok(None),
        }
    }

    /// Replays the head copy `row` to every active replica of `view`
    /// that its commit bitmap does not show as holding it, in chain
    /// order, then restamps the head with `view` and the new bitmap.
    ///
    /// A row written under an older view is replayed to every replica,
    /// since its bitmap positions refer to that older view. A row that
    /// was never stamped is first stamped as an insert at version 1.
    pub(crate) fn repair(&self, view: &View, row: TableRow) -> Result<Repaired> {
        let head = view.head();
        let (mut row, meta) = self.stamp_if_plain(view, row)?;

        let current_view = meta.view_id == view.id();
        if current_view && meta.commit_bitmap.covers(view.required()) {
            return Ok(Repaired {
                replicated: meta.commit_bitmap,
                row,
                meta,
                was_behind: false,
                complete: true,
            });
        }

        let mut replicated = if current_view {
            meta.commit_bitmap
        } else {
            CommitBitmap::single(head.position)
        };

        for replica in view.tails() {
            if replicated.contains(replica.position) {
                continue;
            }

            let bitmap = replicated.with(replica.position);
            let mut copy = row.properties.clone();
            ReplicationMetadata { view_id: view.id(), commit_bitmap: bitmap, ..meta }
                .write_into(&mut copy);

            match self.apply_if_newer(replica, &row.key, copy, meta.version) {
                Ok(written) => {
                    if written {
                        log::debug!(
                            "repaired {} of {} on {}",
                            meta.version,
                            row.key,
                            replica.id()
                        );
                    }
                    replicated = bitmap;
                }
                Err(e) => {
                    log::warn!(
                        "could not repair {} on {}: {}",
                        row.key,
                        replica.id(),
                        e
                    );
                    break;
                }
            }
        }

        let restamped = ReplicationMetadata {
            view_id: view.id(),
            commit_bitmap: replicated,
            ..meta
        };
        // rewriting an unchanged stamp would only bump the head's ETag
        if restamped == meta {
            return Ok(Repaired {
                row,
                meta,
                replicated,
                was_behind: true,
                complete: replicated.covers(view.required()),
            });
        }

        let mut properties = row.properties.clone();
        restamped.write_into(&mut properties);

        let meta = match head.store.replace(&row.key, properties.clone(), &row.etag)
        {
            Ok(etag) => {
                row.properties = properties;
                row.etag = etag;
                restamped
            }
            Err(StoreError::PreconditionFailed | StoreError::NotFound) => {
                log::trace!("{} changed during repair, leaving its bitmap", row.key);
                meta
            }
            Err(e) => {
                log::warn!("could not restamp {} at head {}: {}", row.key, head.id(), e);
                meta
            }
        };

        Ok(Repaired {
            row,
            meta,
            replicated,
            was_behind: true,
            complete: replicated.covers(view.required()),
        })
    }

    // Rows that predate replication carry no metadata. They are
    // stamped in place at the head on first contact.
    fn stamp_if_plain(
        &self,
        view: &View,
        mut row: TableRow,
    ) -> Result<(TableRow, ReplicationMetadata)> {
        let head = view.head();

        for _ in 0..=self.config.conversion_retries {
            if let Some(meta) = ReplicationMetadata::read(&row.key, &row.properties)? {
                return Ok((row, meta));
            }

            let meta = ReplicationMetadata {
                view_id: view.id(),
                tombstone: false,
                last_operation: Operation::Insert,
                commit_bitmap: CommitBitmap::single(head.position),
                version: Version(1),
            };
            let mut properties = row.properties.clone();
            meta.write_into(&mut properties);

            match head.store.replace(&row.key, properties.clone(), &row.etag) {
                Ok(etag) => {
                    log::debug!("stamped plain row {} at head {}", row.key, head.id());
                    row.properties = properties;
                    row.etag = etag;
                    return Ok((row, meta));
                }
                Err(StoreError::PreconditionFailed) => {
                    row = head
                        .store
                        .get(&row.key)
                        .map_err(|e| e.at_head(head.id(), &row.key))?
                        .ok_or_else(|| Error::not_found(&row.key))?;
                }
                Err(e) => return Err(e.at_head(head.id(), &row.key)),
            }
        }

        Err(Error::precondition(&row.key))
    }
}

/// Pages through every head copy of one partition, or of the whole
/// table, tombstones included. Each page is fetched under the view
/// current at that time.
pub(crate) struct HeadRows<'a> {
    replicator: &'a Replicator,
    partition: Option<String>,
    buffered: std::vec::IntoIter<TableRow>,
    view: Option<Arc<View>>,
    continuation: Option<RowKey>,
    exhausted: bool,
}

impl<'a> HeadRows<'a> {
    pub(crate) fn new(
        replicator: &'a Replicator,
        partition: Option<String>,
    ) -> HeadRows<'a> {
        HeadRows {
            replicator,
            partition,
            buffered: Vec::new().into_iter(),
            view: None,
            continuation: None,
            exhausted: false,
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let view = self.replicator.views.current_view()?;
        let head = view.head();

        let page = head
            .store
            .query(
                self.partition.as_deref(),
                self.continuation.as_ref(),
                self.replicator.config.query_page_size,
            )
            .map_err(|e| scan_error(e, head.id()))?;

        self.exhausted = page.continuation.is_none();
        self.continuation = page.continuation;
        self.buffered = page.rows.into_iter();
        self.view = Some(view);
        Ok(())
    }
}

impl Iterator for HeadRows<'_> {
    type Item = Result<(Arc<View>, TableRow)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffered.next() {
                if let Some(view) = &self.view {
                    return Some(Ok((view.clone(), row)));
                }
            }

            if self.exhausted {
                return None;
            }

            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

/// A lazy query over one partition. Rows are repaired as they are
/// read, tombstones are skipped, and the filter sees user columns only.
pub struct Query<'a> {
    rows: HeadRows<'a>,
    filter: Box<dyn Fn(&Entity) -> bool + 'a>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(
        replicator: &'a Replicator,
        partition: Option<String>,
        filter: Box<dyn Fn(&Entity) -> bool + 'a>,
    ) -> Query<'a> {
        Query { rows: HeadRows::new(replicator, partition), filter }
    }
}

impl Iterator for Query<'_> {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Result<Entity>> {
        loop {
            let (view, row) = match self.rows.next()? {
                Ok(next) => next,
                Err(e) => return Some(Err(e)),
            };

            let repaired = match self.rows.replicator.repair(&view, row) {
                Ok(repaired) => repaired,
                Err(e) => return Some(Err(e)),
            };
            if repaired.meta.tombstone {
                continue;
            }

            let entity = repaired.into_entity();
            if (self.filter)(&entity) {
                return Some(Ok(entity));
            }
        }
    }
}
