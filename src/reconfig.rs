use rayon::prelude::*;

use crate::{
    CommitBitmap, Config, Error, Operation, Page, ReplicaId, ReplicationMetadata,
    Result, RowKey, StoreError, TableRow, Version, View,
    backoff::Backoff,
    read::HeadRows,
    write::Replicator,
};

/// What converting an existing table did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConversionSummary {
    /// Rows that received replication metadata.
    pub stamped: usize,
    /// Rows that already carried it, from an earlier interrupted run.
    pub already_stamped: usize,
    /// Rows deleted by their writer while being converted.
    pub vanished: usize,
}

/// What draining a replica did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Rows replayed to the target.
    pub copied: usize,
    /// Rows the target already held under the current view.
    pub skipped: usize,
}

/// What a full reconciliation sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Head rows visited, tombstones included.
    pub scanned: usize,
    /// Rows that had at least one replica behind.
    pub repaired: usize,
    /// Rows still not on every active replica afterwards.
    pub incomplete: usize,
}

enum Stamp {
    Stamped,
    AlreadyStamped,
    Vanished,
}

/// Stamps every row of the head of `view` with initial replication
/// metadata: an insert at version 1, acknowledged by the head only.
/// Rows of a page are stamped in parallel. Each stamp is conditional
/// on the row's `ETag`, so a concurrent legacy writer is never
/// overwritten; the row is re-read and stamped again instead.
pub(crate) fn convert_table(config: &Config, view: &View) -> Result<ConversionSummary> {
    let head = view.head();
    let mut summary = ConversionSummary::default();
    let mut continuation: Option<RowKey> = None;

    loop {
        let page = fetch_page(config, view, continuation.as_ref())?;

        let outcomes: Vec<Result<Stamp>> = page
            .rows
            .into_par_iter()
            .map(|row| stamp_row(config, view, row))
            .collect();

        for outcome in outcomes {
            match outcome? {
                Stamp::Stamped => summary.stamped += 1,
                Stamp::AlreadyStamped => summary.already_stamped += 1,
                Stamp::Vanished => summary.vanished += 1,
            }
        }

        match page.continuation {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }

    log::info!(
        "converted table on {} into {}: {:?}",
        head.id(),
        view.id(),
        summary
    );

    Ok(summary)
}

fn fetch_page(config: &Config, view: &View, after: Option<&RowKey>) -> Result<Page> {
    let head = view.head();
    let backoff = Backoff::new(config.retry_backoff);

    for attempt in 0..=config.conversion_retries {
        match head.store.query(None, after, config.query_page_size) {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() => {
                log::debug!("conversion scan attempt {} on {} failed: {}", attempt, head.id(), e);
                backoff.snooze();
            }
            Err(e) => {
                log::warn!("conversion scan on {} failed: {}", head.id(), e);
                break;
            }
        }
    }

    Err(Error::ReplicaUnreachable(head.id().clone()))
}

fn stamp_row(config: &Config, view: &View, mut row: TableRow) -> Result<Stamp> {
    let head = view.head();
    let backoff = Backoff::new(config.retry_backoff);
    let attempts = config.conversion_retries + 1;

    let meta = ReplicationMetadata {
        view_id: view.id(),
        tombstone: false,
        last_operation: Operation::Insert,
        commit_bitmap: CommitBitmap::single(head.position),
        version: Version(1),
    };

    for attempt in 0..attempts {
        if ReplicationMetadata::read(&row.key, &row.properties)?.is_some() {
            return Ok(if attempt == 0 { Stamp::AlreadyStamped } else { Stamp::Stamped });
        }

        let mut properties = row.properties.clone();
        meta.write_into(&mut properties);

        match head.store.replace(&row.key, properties, &row.etag) {
            Ok(_) => return Ok(Stamp::Stamped),
            Err(StoreError::NotFound) => return Ok(Stamp::Vanished),
            Err(e) => {
                log::trace!("stamping {} failed on attempt {}: {}", row.key, attempt, e);
                if e.is_transient() {
                    backoff.snooze();
                }
                match head.store.get(&row.key) {
                    Ok(Some(fresh)) => row = fresh,
                    Ok(None) => return Ok(Stamp::Vanished),
                    Err(e) => {
                        log::trace!("re-reading {} failed: {}", row.key, e);
                    }
                }
            }
        }
    }

    Err(Error::ConversionAborted { key: row.key, attempts })
}

impl Replicator {
    /// Replays every head row the replica `target` is missing under the
    /// current view, tombstones included. Fails if `target` cannot be
    /// brought up to date, or if the view changes mid-drain.
    pub(crate) fn drain_replica(&self, target: &ReplicaId) -> Result<DrainSummary> {
        let view = self.views.refresh()?;
        let position = view
            .active(target)
            .ok_or_else(|| {
                Error::InvalidView(format!(
                    "replica {} is not active in {}",
                    target,
                    view.id()
                ))
            })?
            .position;

        let mut summary = DrainSummary::default();

        for next in HeadRows::new(self, None) {
            let (page_view, row) = next?;
            if page_view.id() != view.id() {
                return Err(Error::ConfigConflict {
                    expected: Some(view.id()),
                    actual: Some(page_view.id()),
                });
            }

            let meta = ReplicationMetadata::read(&row.key, &row.properties)?;
            if meta.is_some_and(|m| {
                m.view_id == view.id() && m.commit_bitmap.contains(position)
            }) {
                summary.skipped += 1;
                continue;
            }

            let key = row.key.clone();
            let repaired = self.repair(&view, row)?;
            if !repaired.replicated.contains(position) {
                log::warn!("drain of {} stopped at {}", target, key);
                return Err(Error::ReplicaUnreachable(target.clone()));
            }
            summary.copied += 1;
        }

        log::info!("drained {} in {}: {:?}", target, view.id(), summary);
        Ok(summary)
    }

    /// Repairs every head row under the view current when its page was
    /// fetched.
    pub(crate) fn reconcile_all(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        for next in HeadRows::new(self, None) {
            let (view, row) = next?;
            let repaired = self.repair(&view, row)?;

            summary.scanned += 1;
            if repaired.was_behind {
                summary.repaired += 1;
            }
            if !repaired.complete {
                summary.incomplete += 1;
            }
        }

        log::debug!("reconciled all rows: {:?}", summary);
        Ok(summary)
    }
}
