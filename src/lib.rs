//! `rtable` replicates a table across independent table stores that
//! offer nothing more than single-row conditional writes and ordered
//! scans.
//!
//! Replicas form a chain. A write commits at the head with a
//! conditional write, then travels down the chain one replica at a
//! time. Every row carries its own replication metadata (the view it
//! was written in, a logical version, and a bitmap of the replicas
//! that acknowledged it), so a read at the head can tell exactly which
//! replicas are behind and repair them. A failed tail never fails a
//! write; it leaves a gap that reads, background repair, or
//! `RTable::reconcile_all` close later.
//!
//! The set of replicas is described by a `View` published through a
//! `ConfigSource`. Replicas can be added, removed, and reordered while
//! the table is in use: `RTable::begin_reconfiguration` brings new
//! replicas in as write-only, `RTable::drain_replica` copies the
//! existing rows over, and `RTable::commit_reconfiguration` makes them
//! readable.
#![deny(trivial_casts)]

mod backoff;
mod config;
mod config_source;
mod entity;
mod memory;
mod metadata;
mod read;
mod reconciler;
mod reconfig;
mod result;
mod store;
mod table;
mod verify;
mod view;
mod view_manager;
mod write;

pub use crate::{
    config::Config,
    config_source::{ConfigSource, FileConfigSource, MemoryConfigSource},
    entity::{Entity, Properties, Property, RowKey},
    memory::MemoryTable,
    metadata::{
        CommitBitmap, MAX_COUNTER, MAX_REPLICAS, Operation,
        ReplicationMetadata, Version, ViewId,
    },
    read::Query,
    reconfig::{ConversionSummary, DrainSummary, ReconcileSummary},
    result::{Error, Result},
    store::{
        ETag, Page, ReplicaId, ReplicaStore, StoreError, StoreResult, TableRow,
    },
    table::RTable,
    verify::InvariantViolation,
    view::{ReplicaInfo, ReplicaRegistry, Role, View, ViewConfig, ViewReplica},
    view_manager::ViewManager,
    write::{CommitResult, Expected},
};
