use std::{collections::HashSet, fmt, sync::Arc};

use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    CommitBitmap, Error, ReplicaId, ReplicaStore, Result, ViewId,
    metadata::{MAX_COUNTER, MAX_REPLICAS},
};

/// What a replica does in a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Serves reads and receives writes.
    ReadWrite,
    /// Receives writes while it catches up, never serves reads.
    WriteOnly,
    /// Retired, kept in the configuration for reference only.
    None,
}

impl Role {
    /// Whether writes flow to a replica in this role.
    pub fn is_active(self) -> bool {
        matches!(self, Role::ReadWrite | Role::WriteOnly)
    }
}

/// One entry of a view's replica chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: ReplicaId,
    pub role: Role,
    /// The view in which this replica joined the chain.
    pub added_in: ViewId,
}

/// The serializable form of a view, as published by a `ConfigSource`.
///
/// Replicas are listed head first. Writes visit the active ones in list
/// order, and a row's commit bitmap refers to positions in this list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewConfig {
    pub view_id: ViewId,
    pub replicas: Vec<ReplicaInfo>,
    /// The chain requested by an in-progress reconfiguration, applied
    /// when it is committed.
    pub reconfiguration: Option<Vec<ReplicaId>>,
}

impl ViewConfig {
    /// A view in which every listed replica is `ReadWrite`.
    pub fn new<I>(view_id: ViewId, replicas: I) -> ViewConfig
    where
        I: IntoIterator,
        I::Item: Into<ReplicaId>,
    {
        ViewConfig {
            view_id,
            replicas: replicas
                .into_iter()
                .map(|id| ReplicaInfo {
                    id: id.into(),
                    role: Role::ReadWrite,
                    added_in: view_id,
                })
                .collect(),
            reconfiguration: None,
        }
    }

    /// The first active replica.
    pub fn head(&self) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|r| r.role.is_active())
    }

    /// Looks a replica up by id.
    pub fn replica(&self, id: &ReplicaId) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|r| &r.id == id)
    }

    /// Checks the structural rules every published view obeys.
    pub fn validate(&self) -> Result<()> {
        if self.view_id.0 > MAX_COUNTER {
            return Err(Error::InvalidView(format!(
                "{} is past the largest storable id",
                self.view_id
            )));
        }

        if self.replicas.len() > MAX_REPLICAS {
            return Err(Error::InvalidView(format!(
                "{} replicas listed, at most {} are supported",
                self.replicas.len(),
                MAX_REPLICAS
            )));
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if !seen.insert(&replica.id) {
                return Err(Error::InvalidView(format!(
                    "replica {} is listed twice",
                    replica.id
                )));
            }
        }

        match self.head() {
            Some(head) if head.role == Role::ReadWrite => {}
            Some(head) => {
                return Err(Error::InvalidView(format!(
                    "head replica {} is {:?}, it must be ReadWrite",
                    head.id, head.role
                )));
            }
            None => {
                return Err(Error::InvalidView(
                    "no active replica".to_string(),
                ));
            }
        }

        if let Some(target) = &self.reconfiguration {
            if target.is_empty() {
                return Err(Error::InvalidView(
                    "reconfiguration targets an empty chain".to_string(),
                ));
            }
            if let Some(missing) = target
                .iter()
                .find(|id| !self.replica(id).is_some_and(|r| r.role.is_active()))
            {
                return Err(Error::InvalidView(format!(
                    "reconfiguration target {} is not active",
                    missing
                )));
            }
        }

        Ok(())
    }
}

/// Maps replica ids to the stores that back them.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    stores: RwLock<FnvHashMap<ReplicaId, Arc<dyn ReplicaStore>>>,
}

impl ReplicaRegistry {
    /// Creates an empty registry.
    pub fn new() -> ReplicaRegistry {
        ReplicaRegistry::default()
    }

    /// Registers a store under its own id, replacing any previous one.
    pub fn register(&self, store: Arc<dyn ReplicaStore>) {
        let id = store.id().clone();
        self.stores.write().insert(id, store);
    }

    /// Looks a store up.
    pub fn get(&self, id: &ReplicaId) -> Option<Arc<dyn ReplicaStore>> {
        self.stores.read().get(id).cloned()
    }
}

impl<S: ReplicaStore + 'static> FromIterator<Arc<S>> for ReplicaRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<S>>>(iter: I) -> Self {
        let registry = ReplicaRegistry::new();
        for store in iter {
            registry.register(store);
        }
        registry
    }
}

/// A replica of a resolved `View`.
#[derive(Clone, Copy)]
pub struct ViewReplica<'a> {
    /// Index into the view's replica list, used for commit bitmaps.
    pub position: usize,
    pub info: &'a ReplicaInfo,
    pub store: &'a Arc<dyn ReplicaStore>,
}

impl ViewReplica<'_> {
    /// The replica's id.
    pub fn id(&self) -> &ReplicaId {
        &self.info.id
    }
}

/// A validated `ViewConfig` whose active replicas are bound to stores.
pub struct View {
    config: ViewConfig,
    // aligned with config.replicas, `None` for retired replicas
    stores: Vec<Option<Arc<dyn ReplicaStore>>>,
    head: usize,
    required: CommitBitmap,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View").field("config", &self.config).finish()
    }
}

impl View {
    /// Validates `config` and binds its active replicas through
    /// `registry`. An unregistered active replica makes the view
    /// unusable.
    pub fn resolve(config: ViewConfig, registry: &ReplicaRegistry) -> Result<View> {
        config.validate()?;

        let mut stores = Vec::with_capacity(config.replicas.len());
        let mut required = CommitBitmap::default();
        let mut head = None;

        for (position, replica) in config.replicas.iter().enumerate() {
            if !replica.role.is_active() {
                stores.push(None);
                continue;
            }
            let store = registry.get(&replica.id).ok_or_else(|| {
                Error::ConfigUnavailable(format!(
                    "replica {} in {} is not registered",
                    replica.id, config.view_id
                ))
            })?;
            stores.push(Some(store));
            required = required.with(position);
            head.get_or_insert(position);
        }

        let head = head.ok_or_else(|| {
            Error::InvalidView("no active replica".to_string())
        })?;

        Ok(View { config, stores, head, required })
    }

    /// This view's id.
    pub fn id(&self) -> ViewId {
        self.config.view_id
    }

    /// The configuration this view was resolved from.
    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// The head replica: the first active one, always `ReadWrite`. All
    /// writes start and all reads are served here.
    pub fn head(&self) -> ViewReplica<'_> {
        self.at(self.head)
    }

    /// Active replicas in chain order, head first.
    pub fn chain(&self) -> impl Iterator<Item = ViewReplica<'_>> + '_ {
        (0..self.stores.len())
            .filter(move |position| self.stores[*position].is_some())
            .map(move |position| self.at(position))
    }

    /// Active replicas after the head, in chain order.
    pub fn tails(&self) -> impl Iterator<Item = ViewReplica<'_>> + '_ {
        let head = self.head;
        self.chain().filter(move |r| r.position != head)
    }

    /// The bitmap a row needs to be fully replicated in this view.
    pub fn required(&self) -> CommitBitmap {
        self.required
    }

    /// Looks up an active replica by id.
    pub fn active(&self, id: &ReplicaId) -> Option<ViewReplica<'_>> {
        self.chain().find(|r| r.id() == id)
    }

    /// Whether a reconfiguration is in progress.
    pub fn is_reconfiguring(&self) -> bool {
        self.config.reconfiguration.is_some()
    }

    fn at(&self, position: usize) -> ViewReplica<'_> {
        match &self.stores[position] {
            Some(store) => ViewReplica {
                position,
                info: &self.config.replicas[position],
                store,
            },
            None => unreachable!(
                "position {} of {} is retired",
                position, self.config.view_id
            ),
        }
    }
}
