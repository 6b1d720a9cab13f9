//! Pool of worker handles, one per worker path.

use crate::channel::Spawn;
use crate::error::Result;
use crate::handle::{HandleOptions, TerminationGate, WorkerFactory, WorkerHandle, WorkerSession};
use crate::logging::{LogEvent, LogOptions, StructuredLogger};
use crate::protocol::WorkerPath;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Environment variable read by [`PoolConfig::from_env`].
pub const PERMANENT_WORKERS_ENV: &str = "WORKERLINK_PERMANENT_WORKERS";

/// Static pool configuration, fixed when the pool is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Worker paths that are never terminated by context teardown.
    #[serde(default)]
    pub permanent_workers: Vec<WorkerPath>,
}

impl PoolConfig {
    /// Read a comma separated list of permanent worker paths from
    /// `WORKERLINK_PERMANENT_WORKERS`. Unset means none.
    pub fn from_env() -> Self {
        std::env::var(PERMANENT_WORKERS_ENV)
            .map(|list| Self::from_list(&list))
            .unwrap_or_default()
    }

    pub fn from_list(list: &str) -> Self {
        Self {
            permanent_workers: list
                .split(',')
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(WorkerPath::from)
                .collect(),
        }
    }
}

type Slot = Arc<OnceCell<WorkerHandle>>;

struct PoolInner {
    spawner: Arc<dyn Spawn>,
    permanent: HashSet<WorkerPath>,
    workers: Mutex<HashMap<WorkerPath, Slot>>,
    logger: StructuredLogger,
}

/// Memoizes one [`WorkerHandle`] per path.
///
/// Concurrent checkouts of a path share a single spawn. A handle leaves the
/// pool when its last context is destroyed, unless its path is permanent.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(spawner: Arc<dyn Spawn>) -> Self {
        Self::builder(spawner).build()
    }

    pub fn builder(spawner: Arc<dyn Spawn>) -> PoolBuilder {
        PoolBuilder::new(spawner)
    }

    /// Memoized handle for `path`, spawning it on first use. A handle whose
    /// channel has failed is replaced by a fresh spawn.
    pub async fn checkout(&self, path: impl Into<WorkerPath>) -> Result<WorkerHandle> {
        let path = path.into();
        let slot = {
            let mut workers = self.inner.workers.lock();
            if workers.get(&path).map_or(false, slot_is_dead) {
                workers.remove(&path);
                self.inner.logger.warn(
                    LogEvent::WorkerTerminate,
                    "Replacing worker with a closed channel",
                    LogOptions {
                        metadata: Some(json!({ "path": path.as_str() })),
                        ..Default::default()
                    },
                );
            }
            workers.entry(path.clone()).or_default().clone()
        };

        let spawned = slot
            .get_or_try_init(|| {
                let options = HandleOptions::new()
                    .logger(self.inner.logger.clone())
                    .factory(Arc::new(PoolRef::new(&self.inner)))
                    .gate(Arc::new(PoolRef::new(&self.inner)));
                WorkerHandle::spawn(self.inner.spawner.as_ref(), path.clone(), options)
            })
            .await;

        match spawned {
            Ok(handle) => Ok(handle.clone()),
            Err(err) => {
                let mut workers = self.inner.workers.lock();
                if workers
                    .get(&path)
                    .map_or(false, |current| Arc::ptr_eq(current, &slot) && !current.initialized())
                {
                    workers.remove(&path);
                }
                Err(err)
            }
        }
    }

    /// Check out `path` and open a session on it.
    pub async fn use_worker(&self, path: impl Into<WorkerPath>) -> Result<WorkerSession> {
        self.checkout(path).await?.use_worker().await
    }

    /// Drop the memo entry for `path` and terminate its handle. Permanent
    /// paths are left alone and `false` is returned.
    pub fn terminate(&self, path: &WorkerPath) -> bool {
        if self.is_permanent(path) {
            self.inner.logger.termination_deferred(&format!("{} is permanent", path));
            return false;
        }
        let slot = self.inner.workers.lock().remove(path);
        if let Some(handle) = slot.as_ref().and_then(|slot| slot.get()) {
            handle.terminate();
        }
        true
    }

    /// Terminate every handle, permanent ones included.
    pub fn shutdown(&self) {
        let slots: Vec<Slot> = self.inner.workers.lock().drain().map(|(_, slot)| slot).collect();
        for handle in slots.iter().filter_map(|slot| slot.get()) {
            handle.terminate();
        }
        self.inner
            .logger
            .info(LogEvent::WorkerTerminate, "Pool shut down", LogOptions::default());
    }

    pub fn is_permanent(&self, path: &WorkerPath) -> bool {
        self.inner.permanent.contains(path)
    }

    /// The memoized handle for `path`, if one is live.
    pub fn get(&self, path: &WorkerPath) -> Option<WorkerHandle> {
        self.inner
            .workers
            .lock()
            .get(path)
            .and_then(|slot| slot.get())
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub fn contains(&self, path: &WorkerPath) -> bool {
        self.get(path).is_some()
    }

    /// Number of live memoized handles.
    pub fn len(&self) -> usize {
        self.inner
            .workers
            .lock()
            .values()
            .filter(|slot| slot.initialized() && !slot_is_dead(slot))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkerFactory for WorkerPool {
    async fn use_worker(&self, path: &WorkerPath) -> Result<WorkerSession> {
        WorkerPool::use_worker(self, path).await
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.len())
            .field("permanent", &self.inner.permanent)
            .finish()
    }
}

fn slot_is_dead(slot: &Slot) -> bool {
    slot.get().map_or(false, WorkerHandle::is_closed)
}

/// Non-owning pool reference held by pooled handles.
struct PoolRef {
    pool: Weak<PoolInner>,
}

impl PoolRef {
    fn new(inner: &Arc<PoolInner>) -> Self {
        Self {
            pool: Arc::downgrade(inner),
        }
    }

    fn upgrade(&self) -> Option<WorkerPool> {
        self.pool.upgrade().map(|inner| WorkerPool { inner })
    }
}

#[async_trait]
impl WorkerFactory for PoolRef {
    async fn use_worker(&self, path: &WorkerPath) -> Result<WorkerSession> {
        match self.upgrade() {
            Some(pool) => pool.use_worker(path).await,
            None => Err(crate::error::WorkerError::Destroyed),
        }
    }
}

impl TerminationGate for PoolRef {
    fn request_termination(&self, path: &WorkerPath, instance_id: Uuid) -> bool {
        let Some(pool) = self.upgrade() else { return true };
        if pool.is_permanent(path) {
            return false;
        }
        let mut workers = pool.inner.workers.lock();
        let memoized = workers
            .get(path)
            .and_then(|slot| slot.get())
            .map_or(false, |handle| handle.instance_id() == instance_id);
        if memoized {
            workers.remove(path);
        }
        true
    }
}

/// Builder for [`WorkerPool`].
///
/// ```rust,no_run
/// use workerlink::{LocalSpawner, PoolConfig, WorkerPool};
/// use std::sync::Arc;
///
/// let pool = WorkerPool::builder(Arc::new(LocalSpawner::new()))
///     .config(PoolConfig::from_env())
///     .permanent_worker("workers/cache")
///     .build();
/// ```
pub struct PoolBuilder {
    spawner: Arc<dyn Spawn>,
    permanent: HashSet<WorkerPath>,
    logger: StructuredLogger,
}

impl PoolBuilder {
    pub fn new(spawner: Arc<dyn Spawn>) -> Self {
        Self {
            spawner,
            permanent: HashSet::new(),
            logger: StructuredLogger::default(),
        }
    }

    pub fn permanent_worker(mut self, path: impl Into<WorkerPath>) -> Self {
        self.permanent.insert(path.into());
        self
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.permanent.extend(config.permanent_workers);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> WorkerPool {
        WorkerPool {
            inner: Arc::new(PoolInner {
                spawner: self.spawner,
                permanent: self.permanent,
                workers: Mutex::new(HashMap::new()),
                logger: self.logger,
            }),
        }
    }
}
