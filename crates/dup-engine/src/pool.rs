//! Bounded asynchronous dispatch pool.
//!
//! Decouples "decide to duplicate" from "perform the duplicate call": the
//! classifier pushes finalized jobs, worker tasks drain them through a
//! [`JobRunner`]. The queue is the sole shared mutable structure between
//! producers and workers. `push` awaits queue capacity (backpressure on the
//! producer's asynchronous stage) and fails with [`PoolError::Stopped`]
//! once the pool is stopping. Shutdown enqueues one poison sentinel per
//! live worker, so queued jobs drain first and nothing is silently leaked:
//! anything still queued after the workers exit is counted as dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{ConfigError, PoolError};
use crate::request::DuplicationJob;
use crate::stats::{DispatchStats, StatProvider, StatsRegistry};

/// What a worker does with a dequeued job. Production wires the outbound
/// client; tests wire counting stubs.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: DuplicationJob);
}

/// Pool sizing and reporting knobs, mutable only before `start`.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue floor: the pool shrinks toward `min_workers` while the depth
    /// stays at or below this.
    pub min_queue: usize,
    /// Queue ceiling: `push` blocks here, and the pool grows workers while
    /// the depth stays at it.
    pub max_queue: usize,
    /// How long a worker above the minimum stays idle before exiting.
    pub idle_shrink: Duration,
    /// Period of the supervisor's stats report and scaling check.
    pub stats_period: Duration,
    /// Name used in the periodic stats report.
    pub program_name: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            min_workers: 1,
            max_workers: 10,
            min_queue: 1,
            max_queue: 100,
            idle_shrink: Duration::from_secs(10),
            stats_period: Duration::from_secs(10),
            program_name: "dup".to_string(),
        }
    }
}

enum QueueItem {
    Job(DuplicationJob),
    /// Shutdown sentinel: wakes exactly one worker, which exits its loop.
    Poison,
}

struct PoolInner {
    runner: Arc<dyn JobRunner>,
    stats: DispatchStats,
    registry: StatsRegistry,
    settings: Mutex<PoolSettings>,
    started: AtomicBool,
    stopped: AtomicBool,
    tx: Mutex<Option<mpsc::Sender<QueueItem>>>,
    rx: Mutex<Option<Arc<AsyncMutex<mpsc::Receiver<QueueItem>>>>>,
    live_workers: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded multi-worker dispatch pool. Cheap to clone (Arc).
#[derive(Clone)]
pub struct DispatchPool {
    inner: Arc<PoolInner>,
}

impl DispatchPool {
    pub fn new(runner: Arc<dyn JobRunner>, stats: DispatchStats, registry: StatsRegistry) -> Self {
        DispatchPool {
            inner: Arc::new(PoolInner {
                runner,
                stats,
                registry,
                settings: Mutex::new(PoolSettings::default()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tx: Mutex::new(None),
                rx: Mutex::new(None),
                live_workers: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Set the program name used in the stats report. Pre-start only.
    pub fn set_program_name(&self, name: &str) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::Missing("program name"));
        }
        self.pre_start_settings()?.program_name = name.to_string();
        Ok(())
    }

    /// Set the minimum and maximum number of workers. Pre-start only.
    pub fn set_threads(&self, min: usize, max: usize) -> Result<(), ConfigError> {
        if min == 0 || max < min {
            return Err(ConfigError::InvalidBounds {
                what: "number of threads",
                min,
                max,
            });
        }
        let mut settings = self.pre_start_settings()?;
        settings.min_workers = min;
        settings.max_workers = max;
        Ok(())
    }

    /// Set the minimum and maximum queue size. Pre-start only.
    pub fn set_queue(&self, min: usize, max: usize) -> Result<(), ConfigError> {
        if min == 0 || max < min {
            return Err(ConfigError::InvalidBounds {
                what: "queue size",
                min,
                max,
            });
        }
        let mut settings = self.pre_start_settings()?;
        settings.min_queue = min;
        settings.max_queue = max;
        Ok(())
    }

    /// Override the idle-shrink and stats periods. Pre-start only.
    pub fn set_periods(&self, idle_shrink: Duration, stats_period: Duration) -> Result<(), ConfigError> {
        let mut settings = self.pre_start_settings()?;
        settings.idle_shrink = idle_shrink;
        settings.stats_period = stats_period;
        Ok(())
    }

    /// Register a named stat provider polled by the reporting path.
    pub fn add_stat(&self, name: &str, provider: StatProvider) {
        self.inner.registry.register(name, provider);
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.inner.stats
    }

    pub fn worker_count(&self) -> usize {
        self.inner.live_workers.load(Ordering::SeqCst)
    }

    /// Spin up the minimum number of workers and the supervisor. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let settings = self.inner.settings.lock().expect("pool settings poisoned").clone();
        let (tx, rx) = mpsc::channel(settings.max_queue);
        let rx = Arc::new(AsyncMutex::new(rx));
        *self.inner.tx.lock().expect("pool sender poisoned") = Some(tx);
        *self.inner.rx.lock().expect("pool receiver poisoned") = Some(rx.clone());

        for _ in 0..settings.min_workers {
            spawn_worker(&self.inner, &rx);
        }

        let supervisor = tokio::spawn(supervise(self.inner.clone(), rx));
        *self.inner.supervisor.lock().expect("pool supervisor poisoned") = Some(supervisor);

        tracing::info!(
            program = %settings.program_name,
            workers = settings.min_workers,
            max_workers = settings.max_workers,
            max_queue = settings.max_queue,
            "dispatch pool started"
        );
    }

    /// Enqueue a job. Awaits queue capacity when the queue is at its
    /// ceiling; fails once the pool is stopping.
    pub async fn push(&self, job: DuplicationJob) -> Result<(), PoolError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(PoolError::Stopped);
        }
        let tx = self
            .inner
            .tx
            .lock()
            .expect("pool sender poisoned")
            .clone()
            .ok_or(PoolError::Stopped)?;
        tx.send(QueueItem::Job(job))
            .await
            .map_err(|_| PoolError::Stopped)
    }

    /// Signal shutdown, drain queued jobs, join all workers. Idempotent.
    ///
    /// Jobs queued before `stop` are completed (FIFO puts the poison
    /// sentinels behind them); anything that slips in afterwards is drained
    /// without executing and counted as dropped.
    pub async fn stop(&self) {
        if !self.inner.started.load(Ordering::SeqCst)
            || self.inner.stopped.swap(true, Ordering::SeqCst)
        {
            return;
        }

        if let Some(handle) = self
            .inner
            .supervisor
            .lock()
            .expect("pool supervisor poisoned")
            .take()
        {
            handle.abort();
        }

        let tx = self.inner.tx.lock().expect("pool sender poisoned").take();
        if let Some(tx) = tx {
            // One sentinel per live worker; FIFO drains real jobs first.
            let live = self.inner.live_workers.load(Ordering::SeqCst);
            for _ in 0..live {
                if tx.send(QueueItem::Poison).await.is_err() {
                    break;
                }
            }
        }

        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .expect("pool workers poisoned")
            .drain(..)
            .collect();
        for handle in workers {
            let _ = handle.await;
        }

        // Count anything left behind (late pushes racing the stop flag).
        let mut dropped = 0u64;
        let rx = self.inner.rx.lock().expect("pool receiver poisoned").take();
        if let Some(rx) = rx {
            let mut rx = rx.lock().await;
            while let Ok(item) = rx.try_recv() {
                if matches!(item, QueueItem::Job(_)) {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.inner.stats.add_dropped(dropped);
        }

        tracing::info!(
            dropped,
            stats = %self.inner.registry.report_line(),
            "dispatch pool stopped"
        );
    }

    fn pre_start_settings(&self) -> Result<std::sync::MutexGuard<'_, PoolSettings>, ConfigError> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(ConfigError::PoolRunning);
        }
        Ok(self.inner.settings.lock().expect("pool settings poisoned"))
    }
}

/// Current queue depth, derived from the sender's outstanding permits.
fn queue_depth(inner: &PoolInner) -> usize {
    inner
        .tx
        .lock()
        .expect("pool sender poisoned")
        .as_ref()
        .map(|tx| tx.max_capacity() - tx.capacity())
        .unwrap_or(0)
}

fn spawn_worker(inner: &Arc<PoolInner>, rx: &Arc<AsyncMutex<mpsc::Receiver<QueueItem>>>) {
    inner.live_workers.fetch_add(1, Ordering::SeqCst);
    let handle = tokio::spawn(worker_loop(inner.clone(), rx.clone()));
    inner
        .workers
        .lock()
        .expect("pool workers poisoned")
        .push(handle);
}

async fn worker_loop(inner: Arc<PoolInner>, rx: Arc<AsyncMutex<mpsc::Receiver<QueueItem>>>) {
    loop {
        let idle = inner
            .settings
            .lock()
            .expect("pool settings poisoned")
            .idle_shrink;

        let received = timeout(idle, async {
            let mut rx = rx.lock().await;
            rx.recv().await
        })
        .await;

        match received {
            Ok(Some(QueueItem::Job(job))) => {
                inner.runner.run(job).await;
            }
            Ok(Some(QueueItem::Poison)) => {
                inner.live_workers.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            Ok(None) => {
                // Channel closed with no sentinel left for us.
                inner.live_workers.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            Err(_) => {
                if inner.stopped.load(Ordering::SeqCst) {
                    continue;
                }
                let (min_workers, min_queue) = {
                    let settings = inner.settings.lock().expect("pool settings poisoned");
                    (settings.min_workers, settings.min_queue)
                };
                if queue_depth(&inner) <= min_queue {
                    // Shrink only while staying at or above the floor.
                    let shrunk = inner
                        .live_workers
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                            (n > min_workers).then(|| n - 1)
                        })
                        .is_ok();
                    if shrunk {
                        tracing::debug!("idle dispatch worker exiting");
                        return;
                    }
                }
            }
        }
    }
}

/// Periodic stats report plus worker growth while the queue stays saturated.
async fn supervise(inner: Arc<PoolInner>, rx: Arc<AsyncMutex<mpsc::Receiver<QueueItem>>>) {
    let period = inner
        .settings
        .lock()
        .expect("pool settings poisoned")
        .stats_period;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let (program_name, max_workers, max_queue) = {
            let settings = inner.settings.lock().expect("pool settings poisoned");
            (
                settings.program_name.clone(),
                settings.max_workers,
                settings.max_queue,
            )
        };

        tracing::info!(
            program = %program_name,
            workers = inner.live_workers.load(Ordering::SeqCst),
            queued = queue_depth(&inner),
            stats = %inner.registry.report_line(),
            "duplication stats"
        );

        if queue_depth(&inner) >= max_queue
            && inner.live_workers.load(Ordering::SeqCst) < max_workers
        {
            tracing::debug!("queue saturated, growing dispatch workers");
            spawn_worker(&inner, &rx);
        }
    }
}
