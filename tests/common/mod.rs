use std::sync::Arc;
use std::time::Duration;

use rtable::{
    Config, MemoryConfigSource, MemoryTable, RTable, ReplicaRegistry,
    ReplicaStore, ViewConfig, ViewId,
};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record.module_path().unwrap().split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

/// Config tuned for tests: no sleeping between retries, and a lease
/// short enough that `RTable::reconfigure` does not stall.
#[allow(dead_code)]
pub fn test_config() -> Config {
    Config::new()
        .retry_backoff(Duration::ZERO)
        .view_lease(Duration::from_millis(1))
        .query_page_size(7)
}

/// A set of in-memory replicas sharing one registry and one
/// configuration source.
#[allow(dead_code)]
pub struct Cluster {
    pub replicas: Vec<Arc<MemoryTable>>,
    pub registry: Arc<ReplicaRegistry>,
    pub source: Arc<MemoryConfigSource>,
}

#[allow(dead_code)]
impl Cluster {
    pub fn new(names: &[&str]) -> Cluster {
        let replicas: Vec<Arc<MemoryTable>> =
            names.iter().map(|name| Arc::new(MemoryTable::new(*name))).collect();
        let registry = Arc::new(replicas.iter().cloned().collect());
        Cluster {
            replicas,
            registry,
            source: Arc::new(MemoryConfigSource::new()),
        }
    }

    pub fn replica(&self, name: &str) -> &Arc<MemoryTable> {
        self.replicas
            .iter()
            .find(|r| r.id().0 == name)
            .unwrap()
    }

    /// Publishes a view over `chain` and opens a table on it.
    pub fn create(&self, config: Config, chain: &[&str]) -> RTable {
        RTable::create(
            config,
            self.source.clone(),
            self.registry.clone(),
            ViewConfig::new(ViewId(1), chain.iter().copied()),
        )
        .unwrap()
    }

    /// Opens another handle on the already published view, as a second
    /// process would.
    pub fn open(&self, config: Config) -> RTable {
        RTable::open(config, self.source.clone(), self.registry.clone())
            .unwrap()
    }
}

type Hook = Box<dyn FnOnce(&MemoryTable) + Send>;

/// A `MemoryTable` that runs a one-shot hook right before its next
/// insert or replace, to stage races deterministically.
#[allow(dead_code)]
pub struct Hooked {
    pub inner: MemoryTable,
    before_insert: std::sync::Mutex<Option<Hook>>,
    before_replace: std::sync::Mutex<Option<Hook>>,
}

impl std::fmt::Debug for Hooked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooked").field("inner", &self.inner).finish()
    }
}

#[allow(dead_code)]
impl Hooked {
    pub fn new(name: &str) -> Hooked {
        Hooked {
            inner: MemoryTable::new(name),
            before_insert: Default::default(),
            before_replace: Default::default(),
        }
    }

    pub fn before_next_insert<F: FnOnce(&MemoryTable) + Send + 'static>(&self, f: F) {
        *self.before_insert.lock().unwrap() = Some(Box::new(f));
    }

    pub fn before_next_replace<F: FnOnce(&MemoryTable) + Send + 'static>(&self, f: F) {
        *self.before_replace.lock().unwrap() = Some(Box::new(f));
    }
}

impl ReplicaStore for Hooked {
    fn id(&self) -> &rtable::ReplicaId {
        self.inner.id()
    }

    fn get(&self, key: &rtable::RowKey) -> rtable::StoreResult<Option<rtable::TableRow>> {
        self.inner.get(key)
    }

    fn insert(
        &self,
        key: &rtable::RowKey,
        properties: rtable::Properties,
    ) -> rtable::StoreResult<rtable::ETag> {
        let hook = self.before_insert.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        self.inner.insert(key, properties)
    }

    fn replace(
        &self,
        key: &rtable::RowKey,
        properties: rtable::Properties,
        expected: &rtable::ETag,
    ) -> rtable::StoreResult<rtable::ETag> {
        let hook = self.before_replace.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        self.inner.replace(key, properties, expected)
    }

    fn query(
        &self,
        partition: Option<&str>,
        after: Option<&rtable::RowKey>,
        limit: usize,
    ) -> rtable::StoreResult<rtable::Page> {
        self.inner.query(partition, after, limit)
    }
}
