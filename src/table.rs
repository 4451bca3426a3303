use std::{sync::Arc, thread};

use crate::{
    CommitResult, ConfigSource, Config, ConversionSummary, DrainSummary, Entity,
    Error, Expected, InvariantViolation, Query, ReconcileSummary, ReplicaId,
    ReplicaRegistry, Result, RowKey, View, ViewConfig, ViewManager,
    reconciler::Reconciler,
    reconfig::convert_table,
    write::{Replicator, WriteKind},
};

/// A table replicated across a chain of independent table stores.
///
/// Writes commit at the head replica with a conditional write and then
/// travel down the chain. Reads are served by the head and repair any
/// replica the row's commit bitmap shows as behind.
///
/// ```
/// use std::sync::Arc;
/// use rtable::{Config, Entity, MemoryConfigSource, MemoryTable, RTable, ReplicaRegistry, ViewConfig, ViewId};
///
/// let registry: ReplicaRegistry =
///     [Arc::new(MemoryTable::new("head")), Arc::new(MemoryTable::new("tail"))]
///         .into_iter()
///         .collect();
///
/// let table = RTable::create(
///     Config::new(),
///     Arc::new(MemoryConfigSource::new()),
///     Arc::new(registry),
///     ViewConfig::new(ViewId(1), ["head", "tail"]),
/// )
/// .unwrap();
///
/// let committed = table.insert(Entity::new("users", "ada").with("age", 36_i64)).unwrap();
/// assert!(committed.fully_replicated);
///
/// let ada = table.retrieve("users", "ada").unwrap();
/// assert_eq!(ada.get("age").and_then(|age| age.as_i64()), Some(36));
/// ```
pub struct RTable {
    // dropped first, so the repair thread releases its handle on the
    // replicator before this one goes
    reconciler: Option<Reconciler>,
    replicator: Arc<Replicator>,
}

impl RTable {
    /// Opens a table whose view is already published in `source`.
    pub fn open(
        config: Config,
        source: Arc<dyn ConfigSource>,
        registry: Arc<ReplicaRegistry>,
    ) -> Result<RTable> {
        let views = ViewManager::open(source, registry, config.view_lease)?;
        let background_repair = config.background_repair;
        let queue_depth = config.repair_queue_depth;
        let replicator = Arc::new(Replicator { views, config });

        let reconciler = if background_repair {
            match Reconciler::spawn(replicator.clone(), queue_depth) {
                Ok(reconciler) => Some(reconciler),
                Err(e) => {
                    log::error!(
                        "failed to spawn repair thread, relying on read repair: {:?}",
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(RTable { reconciler, replicator })
    }

    /// Publishes `initial` as the first view of a new, empty table and
    /// opens it. Fails with `Error::ConfigConflict` if a view is
    /// already published.
    pub fn create(
        config: Config,
        source: Arc<dyn ConfigSource>,
        registry: Arc<ReplicaRegistry>,
        initial: ViewConfig,
    ) -> Result<RTable> {
        View::resolve(initial.clone(), &registry)?;
        source.publish(&initial, None)?;
        log::info!("created table with {}", initial.view_id);
        RTable::open(config, source, registry)
    }

    /// Converts a plain table, the head of `initial`, into a replicated
    /// one: every row is stamped as an insert at version 1 held only by
    /// the head, then `initial` is published. Other replicas of
    /// `initial` are filled by read repair or `reconcile_all`.
    ///
    /// Legacy writers may keep writing the table while it is converted.
    /// An interrupted conversion can be rerun; rows already stamped are
    /// left alone.
    pub fn convert_existing_table(
        config: Config,
        source: Arc<dyn ConfigSource>,
        registry: Arc<ReplicaRegistry>,
        initial: ViewConfig,
    ) -> Result<(RTable, ConversionSummary)> {
        let view = View::resolve(initial, &registry)?;

        let already_published = match source.load()? {
            None => false,
            Some(published) if &published == view.config() => true,
            Some(published) => {
                return Err(Error::ConfigConflict {
                    expected: None,
                    actual: Some(published.view_id),
                });
            }
        };

        let summary = convert_table(&config, &view)?;

        if !already_published {
            source.publish(view.config(), None)?;
        }

        let table = RTable::open(config, source, registry)?;
        Ok((table, summary))
    }

    /// Creates a row. Fails with `Error::PreconditionFailed` if a live
    /// row exists. A tombstoned row is revived.
    pub fn insert(&self, entity: Entity) -> Result<CommitResult> {
        self.write(WriteKind::Insert, entity, Expected::Any)
    }

    /// Overwrites every user column of a live row.
    pub fn replace<E: Into<Expected>>(
        &self,
        entity: Entity,
        expected: E,
    ) -> Result<CommitResult> {
        self.write(WriteKind::Replace, entity, expected.into())
    }

    /// Overwrites the given columns of a live row, keeping the others.
    pub fn merge<E: Into<Expected>>(
        &self,
        entity: Entity,
        expected: E,
    ) -> Result<CommitResult> {
        self.write(WriteKind::Merge, entity, expected.into())
    }

    /// Deletes a live row by replacing it with a tombstone.
    pub fn delete<E: Into<Expected>>(
        &self,
        key: &RowKey,
        expected: E,
    ) -> Result<CommitResult> {
        let entity = Entity {
            key: key.clone(),
            properties: Default::default(),
            version: None,
        };
        self.write(WriteKind::Delete, entity, expected.into())
    }

    /// Replaces the row if it is live, inserts it otherwise.
    pub fn insert_or_replace(&self, entity: Entity) -> Result<CommitResult> {
        self.write(WriteKind::InsertOrReplace, entity, Expected::Any)
    }

    /// Merges into the row if it is live, inserts it otherwise.
    pub fn insert_or_merge(&self, entity: Entity) -> Result<CommitResult> {
        self.write(WriteKind::InsertOrMerge, entity, Expected::Any)
    }

    fn write(
        &self,
        kind: WriteKind,
        entity: Entity,
        expected: Expected,
    ) -> Result<CommitResult> {
        entity.validate()?;
        let Entity { key, properties, .. } = entity;

        let result = self.replicator.execute(kind, &key, properties, expected);

        if let (Ok(CommitResult { fully_replicated: false, .. }), Some(reconciler)) =
            (&result, &self.reconciler)
        {
            reconciler.enqueue(key);
        }

        result
    }

    /// Reads a live row from the head, repairing lagging replicas on
    /// the way.
    pub fn retrieve(&self, partition_key: &str, row_key: &str) -> Result<Entity> {
        self.replicator.retrieve(&RowKey::new(partition_key, row_key))
    }

    /// Lazily iterates over the live rows of one partition that match
    /// `filter`, in row key order.
    pub fn query<'a, F>(&'a self, partition_key: &str, filter: F) -> Query<'a>
    where
        F: Fn(&Entity) -> bool + 'a,
    {
        Query::new(
            &self.replicator,
            Some(partition_key.to_owned()),
            Box::new(filter),
        )
    }

    /// Lazily iterates over every live row, in key order.
    pub fn scan(&self) -> Query<'_> {
        Query::new(&self.replicator, None, Box::new(|_| true))
    }

    /// The view in effect, reloaded if its lease ran out.
    pub fn current_view(&self) -> Result<Arc<View>> {
        self.replicator.views.current_view()
    }

    /// Reloads the view from the configuration source.
    pub fn refresh_view(&self) -> Result<Arc<View>> {
        self.replicator.views.refresh()
    }

    /// Starts moving to the chain `target`. See
    /// `ViewManager::begin_reconfiguration`.
    pub fn begin_reconfiguration(&self, target: Vec<ReplicaId>) -> Result<Arc<View>> {
        self.replicator.views.begin_reconfiguration(target)
    }

    /// Finishes a reconfiguration started with `begin_reconfiguration`.
    pub fn commit_reconfiguration(&self, pending: &View) -> Result<Arc<View>> {
        self.replicator.views.commit_reconfiguration(pending)
    }

    /// Copies every row `target` is missing from the head.
    pub fn drain_replica(&self, target: &ReplicaId) -> Result<DrainSummary> {
        self.replicator.drain_replica(target)
    }

    /// Moves to the chain `target` in one call: begins the
    /// reconfiguration, waits one view lease so that every process has
    /// picked up the pending view, drains every replica, and commits.
    pub fn reconfigure(&self, target: Vec<ReplicaId>) -> Result<Arc<View>> {
        let pending = self.begin_reconfiguration(target)?;

        thread::sleep(self.replicator.config.view_lease);

        let tails: Vec<ReplicaId> =
            pending.tails().map(|r| r.id().clone()).collect();
        for id in &tails {
            self.drain_replica(id)?;
        }

        self.commit_reconfiguration(&pending)
    }

    /// Repairs one row now. Returns whether every active replica holds
    /// it afterwards, or `false` if the head has no copy.
    pub fn repair_row(&self, partition_key: &str, row_key: &str) -> Result<bool> {
        let key = RowKey::new(partition_key, row_key);
        key.validate()?;
        let view = self.current_view()?;
        Ok(self
            .replicator
            .repair_key(&view, &key)?
            .is_some_and(|repaired| repaired.complete))
    }

    /// Repairs every row of the table.
    pub fn reconcile_all(&self) -> Result<ReconcileSummary> {
        self.replicator.reconcile_all()
    }

    /// Waits until the background repairer has handled every row queued
    /// so far. Returns immediately without background repair.
    pub fn flush_repairs(&self) {
        if let Some(reconciler) = &self.reconciler {
            reconciler.flush();
        }
    }

    /// Compares every replica against the head. Only meaningful while
    /// the table is quiescent.
    pub fn check_replica_invariants(&self) -> Result<Vec<InvariantViolation>> {
        self.replicator.check_replica_invariants()
    }
}
