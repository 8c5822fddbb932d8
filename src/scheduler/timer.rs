//! Timer bookkeeping owned by the scheduler's timer task.
//!
//! All timers live inside a [`TimerQueue`] that belongs to exactly one
//! task.  Other parts of the crate talk to it through
//! [`TimerCommand`]s, so adding, cancelling and rescheduling never
//! contend on a shared lock and the sweep never blocks on a callback.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use super::spawn_worker;

pub(crate) type TimerId = u64;

/// How a periodic timer behaves when a firing overruns its interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FiringPolicy {
    /// Skip the missed ticks and schedule the next run at
    /// `now + interval`.
    #[default]
    Skip,
    /// Run every missed tick, back to back, until caught up.
    CatchUp,
}

impl FiringPolicy {
    /// Next run time for a periodic timer whose firing scheduled at
    /// `nominal` has just finished at `now`.
    pub fn next_run(self, nominal: Instant, interval: Duration, now: Instant) -> Instant {
        let next = nominal + interval;
        if next > now {
            return next;
        }
        match self {
            FiringPolicy::Skip => now + interval,
            FiringPolicy::CatchUp => next,
        }
    }
}

pub(crate) enum TimerTask {
    Once(Box<dyn FnOnce() + Send + 'static>),
    Repeat(Arc<dyn Fn() + Send + Sync + 'static>),
}

pub(crate) struct Timer {
    pub id: TimerId,
    pub task: TimerTask,
    pub next_run: Instant,
    pub interval: Option<Duration>,
    pub policy: FiringPolicy,
    pub cancelled: Arc<AtomicBool>,
}

pub(crate) enum TimerCommand {
    Insert(Timer),
    Cancel(TimerId),
    Finished(TimerId),
    Count(oneshot::Sender<usize>),
    Shutdown,
}

/// Cancellable handle returned for delayed and periodic work.
#[derive(Clone, Debug)]
pub struct TimerHandle {
    id: TimerId,
    cancelled: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<TimerCommand>,
}

impl TimerHandle {
    pub(crate) fn new(
        id: TimerId,
        cancelled: Arc<AtomicBool>,
        commands: mpsc::UnboundedSender<TimerCommand>,
    ) -> Self {
        Self {
            id,
            cancelled,
            commands,
        }
    }

    /// Stop any further firings.  A firing already executing runs to
    /// completion.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(TimerCommand::Cancel(self.id));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct TimerQueue {
    deadlines: BTreeSet<(Instant, TimerId)>,
    waiting: HashMap<TimerId, Timer>,
    running: HashMap<TimerId, Timer>,
}

impl TimerQueue {
    fn insert(&mut self, timer: Timer) {
        self.deadlines.insert((timer.next_run, timer.id));
        self.waiting.insert(timer.id, timer);
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(timer) = self.waiting.remove(&id) {
            self.deadlines.remove(&(timer.next_run, id));
        }
        // a running timer is dropped when its firing reports back
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().next().map(|(at, _)| *at)
    }

    fn take_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(&(at, id)) = self.deadlines.iter().next() {
            if at > now {
                break;
            }
            self.deadlines.remove(&(at, id));
            if let Some(timer) = self.waiting.remove(&id) {
                due.push(timer);
            }
        }
        due
    }

    fn len(&self) -> usize {
        self.waiting.len() + self.running.len()
    }
}

/// The single timer task.  Runs until a shutdown command arrives; the
/// scheduler sends one when its last clone is dropped.
pub(crate) async fn run_timers(
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    feedback: mpsc::UnboundedSender<TimerCommand>,
    workers: Arc<Semaphore>,
) {
    let mut queue = TimerQueue::default();
    loop {
        let deadline = queue.next_deadline();
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None | Some(TimerCommand::Shutdown) => break,
                Some(TimerCommand::Insert(timer)) => queue.insert(timer),
                Some(TimerCommand::Cancel(id)) => queue.cancel(id),
                Some(TimerCommand::Finished(id)) => {
                    if let Some(timer) = queue.running.remove(&id) {
                        reschedule(&mut queue, timer);
                    }
                }
                Some(TimerCommand::Count(reply)) => {
                    let _ = reply.send(queue.len());
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                let due = queue.take_due(Instant::now());
                trace!(count = due.len(), "firing due timers");
                for timer in due {
                    fire(&mut queue, timer, &feedback, &workers);
                }
            }
        }
    }
    debug!(remaining = queue.len(), "timer task stopped");
}

fn reschedule(queue: &mut TimerQueue, mut timer: Timer) {
    if timer.cancelled.load(Ordering::SeqCst) {
        return;
    }
    if let Some(interval) = timer.interval {
        timer.next_run = timer.policy.next_run(timer.next_run, interval, Instant::now());
        queue.insert(timer);
    }
}

fn fire(
    queue: &mut TimerQueue,
    timer: Timer,
    feedback: &mpsc::UnboundedSender<TimerCommand>,
    workers: &Arc<Semaphore>,
) {
    if timer.cancelled.load(Ordering::SeqCst) {
        return;
    }
    let Timer {
        id,
        task,
        next_run,
        interval,
        policy,
        cancelled,
    } = timer;
    match task {
        TimerTask::Once(task) => {
            spawn_worker(workers.clone(), move || {
                if !cancelled.swap(true, Ordering::SeqCst) {
                    task();
                }
            });
        }
        TimerTask::Repeat(task) => {
            let run = task.clone();
            let flag = cancelled.clone();
            queue.running.insert(
                id,
                Timer {
                    id,
                    task: TimerTask::Repeat(task),
                    next_run,
                    interval,
                    policy,
                    cancelled,
                },
            );
            let feedback = feedback.clone();
            let workers = workers.clone();
            tokio::spawn(async move {
                let firing = spawn_worker(workers, move || {
                    if !flag.load(Ordering::SeqCst) {
                        run();
                    }
                });
                let _ = firing.await;
                let _ = feedback.send(TimerCommand::Finished(id));
            });
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
