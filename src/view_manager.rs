use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use crate::{
    ConfigSource, Error, ReplicaId, ReplicaInfo, ReplicaRegistry, Result, Role,
    View, ViewConfig,
};

struct Cached {
    view: Arc<View>,
    loaded_at: Instant,
}

/// Caches the published view for a bounded lease and drives the two
/// publication steps of a reconfiguration.
pub struct ViewManager {
    source: Arc<dyn ConfigSource>,
    registry: Arc<ReplicaRegistry>,
    lease: Duration,
    cached: RwLock<Cached>,
}

impl ViewManager {
    /// Loads the published view. Fails with `Error::ConfigUnavailable`
    /// if nothing has been published or a listed replica is not
    /// registered.
    pub fn open(
        source: Arc<dyn ConfigSource>,
        registry: Arc<ReplicaRegistry>,
        lease: Duration,
    ) -> Result<ViewManager> {
        let config = load_published(&*source)?;
        let view = Arc::new(View::resolve(config, &registry)?);

        log::info!(
            "opened {} with chain {:?}",
            view.id(),
            view.chain().map(|r| r.id().0.clone()).collect::<Vec<_>>()
        );

        Ok(ViewManager {
            source,
            registry,
            lease,
            cached: RwLock::new(Cached { view, loaded_at: Instant::now() }),
        })
    }

    /// The last view loaded, regardless of its lease.
    pub fn cached_view(&self) -> Arc<View> {
        self.cached.read().view.clone()
    }

    /// The cached view while its lease holds, otherwise a freshly
    /// loaded one.
    pub fn current_view(&self) -> Result<Arc<View>> {
        {
            let cached = self.cached.read();
            if cached.loaded_at.elapsed() < self.lease {
                return Ok(cached.view.clone());
            }
        }
        self.refresh()
    }

    /// Reloads the view from the configuration source. A published
    /// view older than the cached one is ignored.
    pub fn refresh(&self) -> Result<Arc<View>> {
        let config = load_published(&*self.source)?;

        let cached_id = self.cached.read().view.id();
        if config.view_id < cached_id {
            log::warn!(
                "configuration source went back from {} to {}, keeping the newer view",
                cached_id,
                config.view_id
            );
            return Ok(self.touch());
        }
        if config.view_id == cached_id {
            return Ok(self.touch());
        }

        let view = Arc::new(View::resolve(config, &self.registry)?);
        Ok(self.install(view))
    }

    /// Publishes a view in which every replica of `target` that is not
    /// already active joins as `WriteOnly`, while every currently
    /// active replica keeps its role and position. Replicas missing
    /// from `target` keep receiving writes until the reconfiguration
    /// is committed.
    ///
    /// The first replica of `target` becomes the head on commit and
    /// must already be `ReadWrite`.
    pub fn begin_reconfiguration(&self, target: Vec<ReplicaId>) -> Result<Arc<View>> {
        let base = self.refresh()?;
        let base_config = base.config();

        if base.is_reconfiguring() {
            return Err(Error::InvalidView(format!(
                "{} already has a reconfiguration in progress",
                base.id()
            )));
        }

        match target.first().and_then(|id| base_config.replica(id)) {
            Some(head) if head.role == Role::ReadWrite => {}
            Some(head) => {
                return Err(Error::InvalidView(format!(
                    "new head {} is {:?}, it must already be ReadWrite",
                    head.id, head.role
                )));
            }
            None => {
                return Err(Error::InvalidView(format!(
                    "new head {:?} is not an active replica of {}",
                    target.first(),
                    base.id()
                )));
            }
        }

        let view_id = base.id().next();

        let mut replicas: Vec<ReplicaInfo> = base_config
            .replicas
            .iter()
            .filter(|r| r.role.is_active())
            .cloned()
            .collect();

        for id in &target {
            if !replicas.iter().any(|r| &r.id == id) {
                replicas.push(ReplicaInfo {
                    id: id.clone(),
                    role: Role::WriteOnly,
                    added_in: view_id,
                });
            }
        }

        replicas.extend(
            base_config
                .replicas
                .iter()
                .filter(|r| !r.role.is_active() && !target.contains(&r.id))
                .cloned(),
        );

        let pending =
            ViewConfig { view_id, replicas, reconfiguration: Some(target) };

        let view = self.publish(pending, &base)?;
        log::info!("began reconfiguration in {}", view.id());
        Ok(view)
    }

    /// Promotes every `WriteOnly` replica of `pending` to `ReadWrite`,
    /// retires the replicas left out of the requested chain, and
    /// reorders the chain as requested. Fails with
    /// `Error::ConfigConflict` if `pending` is no longer the published
    /// view.
    ///
    /// Incoming replicas must have been drained first.
    pub fn commit_reconfiguration(&self, pending: &View) -> Result<Arc<View>> {
        let current = self.refresh()?;
        if current.id() != pending.id() {
            return Err(Error::ConfigConflict {
                expected: Some(pending.id()),
                actual: Some(current.id()),
            });
        }

        let current_config = current.config();
        let target = current_config.reconfiguration.as_ref().ok_or_else(|| {
            Error::InvalidView(format!(
                "{} has no reconfiguration in progress",
                current.id()
            ))
        })?;

        let mut replicas = Vec::with_capacity(current_config.replicas.len());
        for id in target {
            let info = current_config.replica(id).ok_or_else(|| {
                Error::InvalidView(format!("target replica {} vanished", id))
            })?;
            replicas.push(ReplicaInfo { role: Role::ReadWrite, ..info.clone() });
        }

        // only replicas leaving now are kept as retired entries
        replicas.extend(
            current_config
                .replicas
                .iter()
                .filter(|r| r.role.is_active() && !target.contains(&r.id))
                .map(|r| ReplicaInfo { role: Role::None, ..r.clone() }),
        );

        let committed = ViewConfig {
            view_id: current.id().next(),
            replicas,
            reconfiguration: None,
        };

        let view = self.publish(committed, &current)?;
        log::info!(
            "committed reconfiguration in {}, chain is now {:?}",
            view.id(),
            view.chain().map(|r| r.id().0.clone()).collect::<Vec<_>>()
        );
        Ok(view)
    }

    fn publish(&self, config: ViewConfig, base: &View) -> Result<Arc<View>> {
        let view = Arc::new(View::resolve(config, &self.registry)?);
        self.source.publish(view.config(), Some(base.id()))?;
        Ok(self.install(view))
    }

    fn touch(&self) -> Arc<View> {
        let mut cached = self.cached.write();
        cached.loaded_at = Instant::now();
        cached.view.clone()
    }

    fn install(&self, view: Arc<View>) -> Arc<View> {
        let mut cached = self.cached.write();
        if view.id() > cached.view.id() {
            log::debug!("installing {}", view.id());
            cached.view = view;
        }
        cached.loaded_at = Instant::now();
        cached.view.clone()
    }
}

fn load_published(source: &dyn ConfigSource) -> Result<ViewConfig> {
    source.load()?.ok_or_else(|| {
        Error::ConfigUnavailable("no view has been published".to_string())
    })
}
