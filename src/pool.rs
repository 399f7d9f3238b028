use super::{
    errors::{ConfigError, SpawnError},
    handle::{self, Task, TaskHandle},
    model::{JobStatus, PoolMetrics},
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use crossbeam::deque::{Injector, Steal};
use tokio::{
    sync::Notify,
    task::JoinSet,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;


/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workers kept warm even when idle.
    pub core_workers: usize,
    /// Upper bound on live workers, and so on concurrently running units.
    pub max_workers: usize,
    /// Idle time after which a worker above `core_workers` retires.
    pub keep_alive: Duration,
    pub thread_name_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core_workers: 5,
            max_workers: 10,
            keep_alive: Duration::from_secs(30),
            thread_name_prefix: "async-worker".to_string(),
        }
    }
}

impl Config {
    /// Reads overrides from the environment, falling back to the defaults:
    ///
    /// - `ASYNC_POOL_CORE_WORKERS`
    /// - `ASYNC_POOL_MAX_WORKERS`
    /// - `ASYNC_POOL_KEEP_ALIVE_SECS`
    /// - `ASYNC_POOL_THREAD_PREFIX`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            core_workers: env_parse("ASYNC_POOL_CORE_WORKERS").unwrap_or(defaults.core_workers),
            max_workers: env_parse("ASYNC_POOL_MAX_WORKERS").unwrap_or(defaults.max_workers),
            keep_alive: env_parse("ASYNC_POOL_KEEP_ALIVE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive),
            thread_name_prefix: std::env::var("ASYNC_POOL_THREAD_PREFIX")
                .unwrap_or(defaults.thread_name_prefix),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_workers == 0 {
            return Err(ConfigError::NoCoreWorkers);
        }
        if self.max_workers < self.core_workers {
            return Err(ConfigError::MaxBelowCore {
                core: self.core_workers,
                max: self.max_workers,
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}


pub type ThreadPool = Arc<WorkerPool>;

enum Wake {
    Work,
    Expired,
    Shutdown,
}

/// Bounded, dynamically sized pool of worker tasks.
///
/// Keeps `core_workers` warm, grows to `max_workers` while work is queued and
/// nobody is idle, and retires extra workers after `keep_alive`. The queue has
/// no capacity limit: excess work waits, it is never rejected for load.
pub struct WorkerPool {
    inject: Injector<Task>,
    work_available: Notify,
    shutdown_token: CancellationToken,
    workers: Mutex<JoinSet<()>>,
    workers_exited: Notify,
    live_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    active_tasks: AtomicUsize,
    queued_tasks: AtomicUsize,
    total_submitted: AtomicUsize,
    completed_tasks: AtomicUsize,
    failed_tasks: AtomicUsize,
    cancelled_tasks: AtomicUsize,
    next_worker_id: AtomicUsize,
    config: Config,
}

impl WorkerPool {
    pub fn new(core_workers: usize, max_workers: usize) -> ThreadPool {
        let config = Config {
            core_workers,
            max_workers,
            ..Default::default()
        };
        Self::with_config(config)
    }

    /// Builds the pool and starts its core workers. Must run inside a tokio
    /// runtime. Invalid bounds are clamped (at least one core worker, max no
    /// lower than core); use [`Config::validate`] to reject them instead.
    pub fn with_config(mut config: Config) -> ThreadPool {
        config.core_workers = config.core_workers.max(1);
        config.max_workers = config.max_workers.max(config.core_workers);

        let pool = Arc::new(WorkerPool {
            inject: Injector::new(),
            work_available: Notify::new(),
            shutdown_token: CancellationToken::new(),
            workers: Mutex::new(JoinSet::new()),
            workers_exited: Notify::new(),
            live_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
            total_submitted: AtomicUsize::new(0),
            completed_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
            cancelled_tasks: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(1),
            config,
        });

        for _ in 0..pool.config.core_workers {
            pool.live_workers.fetch_add(1, Ordering::AcqRel);
            pool.spawn_worker();
        }

        pool
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Queues `f` for execution on a worker.
    ///
    /// `f` receives the unit's cancellation token, a child of the pool's
    /// shutdown token. Fails only once the pool is shut down.
    pub fn submit<T, F, Fut>(self: &Arc<Self>, f: F) -> Result<TaskHandle<T>, SpawnError>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(SpawnError::Shutdown);
        }

        let (handle, job) = handle::task(self.shutdown_token.child_token(), f);
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
        self.push_task(job);
        Ok(handle)
    }

    #[inline]
    fn push_task(self: &Arc<Self>, task: Task) {
        self.queued_tasks.fetch_add(1, Ordering::AcqRel);
        self.inject.push(task);

        // Lost a race with shutdown: nobody will pop this any more.
        if self.is_shutdown() {
            self.discard_queued();
            return;
        }

        if self.idle_workers.load(Ordering::Acquire) == 0 {
            self.try_grow();
        }
        self.work_available.notify_one();
    }

    fn try_grow(self: &Arc<Self>) {
        let grown = self
            .live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_workers).then_some(live + 1)
            })
            .is_ok();
        if grown {
            self.spawn_worker();
        }
    }

    /// Spawns one worker. The caller has already counted it in `live_workers`.
    fn spawn_worker(self: &Arc<Self>) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.config.thread_name_prefix, id);
        let span = tracing::debug_span!("worker", name = %name);
        let pool = Arc::clone(self);

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        while workers.try_join_next().is_some() {}
        workers.spawn(async move { pool.worker_loop().await }.instrument(span));
    }

    fn pop(&self) -> Option<Task> {
        loop {
            match self.inject.steal() {
                Steal::Success(task) => {
                    self.queued_tasks.fetch_sub(1, Ordering::AcqRel);
                    return Some(task);
                }
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    fn try_retire(&self) -> bool {
        self.live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > self.config.core_workers).then_some(live - 1)
            })
            .is_ok()
    }

    async fn worker_loop(self: Arc<Self>) {
        tracing::trace!("worker started");

        loop {
            if self.is_shutdown() {
                break;
            }

            if let Some(task) = self.pop() {
                self.active_tasks.fetch_add(1, Ordering::AcqRel);
                let status = task.await;
                self.record(status);
                self.active_tasks.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            self.idle_workers.fetch_add(1, Ordering::AcqRel);
            if !self.inject.is_empty() {
                self.idle_workers.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            let wake = tokio::select! {
                _ = self.work_available.notified() => Wake::Work,
                _ = self.shutdown_token.cancelled() => Wake::Shutdown,
                _ = tokio::time::sleep(self.config.keep_alive) => Wake::Expired,
            };
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);

            match wake {
                Wake::Work => {}
                Wake::Shutdown => break,
                Wake::Expired => {
                    if self.inject.is_empty() && self.try_retire() {
                        tracing::debug!("idle worker retired");
                        self.workers_exited.notify_waiters();
                        return;
                    }
                }
            }
        }

        self.live_workers.fetch_sub(1, Ordering::AcqRel);
        self.workers_exited.notify_waiters();
        tracing::trace!("worker stopped");
    }

    fn record(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.completed_tasks,
            JobStatus::Failed => &self.failed_tasks,
            JobStatus::Cancelled => &self.cancelled_tasks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            live_workers: self.live_workers.load(Ordering::Relaxed),
            idle_workers: self.idle_workers.load(Ordering::Relaxed),
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            cancelled_tasks: self.cancelled_tasks.load(Ordering::Relaxed),
        }
    }

    /// Forceful, non-blocking shutdown.
    ///
    /// Stops accepting work, interrupts every running unit through its token
    /// and discards queued units (their handles resolve to `Cancelled`).
    /// Returns how many queued units were discarded. Repeated calls are no-ops.
    pub fn shutdown(&self) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        self.shutdown_token.cancel();

        let dropped = self.discard_queued();
        tracing::info!(dropped, "worker pool shut down");
        dropped
    }

    fn discard_queued(&self) -> usize {
        let mut dropped = 0;
        while let Some(task) = self.pop() {
            drop(task);
            dropped += 1;
        }
        self.cancelled_tasks.fetch_add(dropped, Ordering::Relaxed);
        dropped
    }

    /// Drains in-flight work for at most `timeout`, then forces the rest.
    ///
    /// New submissions are rejected from the start. Returns `true` when every
    /// worker exited within the bound.
    pub async fn shutdown_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        self.shutdown();
        let drained = self.wait_for_workers(deadline).await;
        if !drained {
            tracing::warn!(
                live = self.live_workers.load(Ordering::Relaxed),
                "graceful drain timed out, aborting workers"
            );
            self.workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .abort_all();
        }
        drained
    }

    async fn wait_for_workers(&self, deadline: Instant) -> bool {
        loop {
            let exited = self.workers_exited.notified();
            if self.live_workers.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, exited).await.is_err() {
                return self.live_workers.load(Ordering::Acquire) == 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bounds() {
        let config = Config::default();
        assert_eq!(config.core_workers, 5);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let config = Config {
            core_workers: 4,
            max_workers: 2,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxBelowCore { core: 4, max: 2 })
        );

        let config = Config {
            core_workers: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoCoreWorkers));
    }

    #[tokio::test]
    async fn core_workers_start_warm() {
        let pool = WorkerPool::new(3, 6);
        assert_eq!(pool.metrics().live_workers, 3);
        pool.shutdown();
    }
}
