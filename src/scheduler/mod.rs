//! Timer and worker scheduling.
//!
//! The [`Scheduler`] is the substrate every other component uses for
//! asynchronous execution.  One-shot work goes straight to the worker
//! pool via [`Scheduler::run_async`]; delayed and periodic work is
//! registered with a single timer task which wakes at the earliest
//! deadline, detaches the due timers and hands them to the pool.
//!
//! Workers run on tokio's blocking pool, bounded by a semaphore sized
//! from [`SchedulerSection::max_workers`], so scheduled callbacks may
//! block on I/O without stalling the timer sweep or the frame readers.
//!
//! A scheduler is an explicit value passed to the components that need
//! it.  For convenience a process-wide default can be installed with
//! [`Scheduler::install_default`].

mod timer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::SchedulerSection;

pub use timer::{FiringPolicy, TimerHandle};
use timer::{run_timers, Timer, TimerCommand, TimerTask};

static DEFAULT: OnceLock<Scheduler> = OnceLock::new();

/// Handle to a timer task plus a bounded worker pool.  Cloning is
/// cheap; all clones drive the same timer task.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    workers: Arc<Semaphore>,
    commands: mpsc::UnboundedSender<TimerCommand>,
    next_id: AtomicU64,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        let _ = self.commands.send(TimerCommand::Shutdown);
    }
}

impl Scheduler {
    /// Create a scheduler and spawn its timer task.  Must be called
    /// from within a tokio runtime.
    pub fn new(config: &SchedulerSection) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_timers(rx, tx.clone(), workers.clone()));
        Self {
            inner: Arc::new(SchedulerInner {
                workers,
                commands: tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Install a process-wide default.  Returns `false` if one was
    /// already installed.
    pub fn install_default(scheduler: Scheduler) -> bool {
        DEFAULT.set(scheduler).is_ok()
    }

    pub fn default_instance() -> Option<Scheduler> {
        DEFAULT.get().cloned()
    }

    /// Run a task on the worker pool.  No ordering is guaranteed
    /// relative to other tasks.
    pub fn run_async<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        spawn_worker(self.inner.workers.clone(), task);
    }

    /// Run a task once after `delay`.
    pub fn run_after_delay<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.insert(TimerTask::Once(Box::new(task)), delay, None, FiringPolicy::Skip)
    }

    /// Run a task first after `first_run`, then every `interval`.
    pub fn run_periodic<F>(
        &self,
        first_run: Duration,
        interval: Duration,
        policy: FiringPolicy,
        task: F,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(TimerTask::Repeat(Arc::new(task)), first_run, Some(interval), policy)
    }

    /// Number of timers still waiting or running.
    pub async fn timer_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.inner.commands.send(TimerCommand::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stop the timer task.  Pending timers never fire afterwards;
    /// worker tasks already running complete normally.
    pub fn shutdown(&self) {
        let _ = self.inner.commands.send(TimerCommand::Shutdown);
    }

    fn insert(
        &self,
        task: TimerTask,
        delay: Duration,
        interval: Option<Duration>,
        policy: FiringPolicy,
    ) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let timer = Timer {
            id,
            task,
            next_run: Instant::now() + delay,
            interval,
            policy,
            cancelled: cancelled.clone(),
        };
        if self.inner.commands.send(TimerCommand::Insert(timer)).is_err() {
            warn!(timer = id, "timer task is gone; timer will never fire");
        }
        TimerHandle::new(id, cancelled, self.inner.commands.clone())
    }
}

/// Run `task` on the blocking pool once a worker permit is free.
/// Panics are contained and logged.
pub(crate) fn spawn_worker<F>(workers: Arc<Semaphore>, task: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let Ok(_permit) = workers.acquire_owned().await else {
            return;
        };
        if let Err(err) = tokio::task::spawn_blocking(task).await {
            if err.is_panic() {
                error!("scheduled task panicked");
            }
        }
    })
}
