//! Fixed-rate tick loop driving the node's periodic duties.
//!
//! The scheduler runs one task that wakes at the configured rate, publishes
//! a [`TickEvent`], runs its permanent hooks and then every queued job whose
//! tick has come. Jobs execute inline on the scheduler task, so a slow job
//! delays the current tick; the interval then fires immediately until the
//! loop has caught up, it never skips a tick.

use crossbeam::queue::SegQueue;
use futures::future::BoxFuture;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Default cadence of the cluster main loop.
pub const DEFAULT_TICKS_PER_SECOND: u32 = 10;

/// Weight of the newest sample in the rolling tick-time average.
const TICK_TIME_ALPHA: f64 = 0.1;

/// Published at the start of every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickEvent {
    pub tick: u64,
}

/// Work executed on the scheduler task.
pub type TickJob = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;

struct QueuedTask {
    seq: u64,
    run_at: u64,
    every: Option<u64>,
    remaining: Option<u64>,
    job: TickJob,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.run_at, self.seq).cmp(&(other.run_at, other.seq))
    }
}

/// Tick loop with a lock-free inbox for cross-task scheduling.
///
/// Jobs submitted from any task land in the inbox and are folded into the
/// run queue on the next tick. Ordering among jobs due on the same tick is
/// submission order.
pub struct TickScheduler {
    tick_millis: u64,
    current_tick: AtomicU64,
    average_tick: AtomicU64,
    seq: AtomicU64,
    inbox: SegQueue<QueuedTask>,
    hooks: Mutex<Vec<TickJob>>,
    events: broadcast::Sender<TickEvent>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TickScheduler {
    pub fn new(ticks_per_second: u32) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            tick_millis: (1000 / u64::from(ticks_per_second.max(1))).max(1),
            current_tick: AtomicU64::new(0),
            average_tick: AtomicU64::new(0f64.to_bits()),
            seq: AtomicU64::new(0),
            inbox: SegQueue::new(),
            hooks: Mutex::new(Vec::new()),
            events,
            running: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    pub fn tick_millis(&self) -> u64 {
        self.tick_millis
    }

    /// Number of the tick currently (or last) processed.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::SeqCst)
    }

    /// Rolling average of how long one tick's work takes.
    pub fn average_tick_millis(&self) -> f64 {
        f64::from_bits(self.average_tick.load(Ordering::SeqCst))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TickEvent> {
        self.events.subscribe()
    }

    /// Adds a hook that runs on every tick, before queued jobs. Hooks
    /// registered after `start` never run.
    pub fn add_tick_hook<F>(&self, hook: F)
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Runs a job on the next tick.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.submit(1, None, None, Box::new(job));
    }

    /// Runs a job once after roughly the given delay, rounded up to whole
    /// ticks.
    pub fn schedule_delayed<F>(&self, delay: Duration, job: F)
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.submit(self.ticks_for(delay), None, None, Box::new(job));
    }

    /// Runs a job repeatedly. `max_executions` of `None` repeats forever;
    /// `Some(0)` schedules nothing.
    pub fn schedule_periodic<F>(&self, every: Duration, max_executions: Option<u64>, job: F)
    where
        F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
    {
        if max_executions == Some(0) {
            return;
        }
        let every_ticks = self.ticks_for(every);
        self.submit(every_ticks, Some(every_ticks), max_executions, Box::new(job));
    }

    fn ticks_for(&self, delay: Duration) -> u64 {
        let millis = delay.as_millis() as u64;
        (millis.div_ceil(self.tick_millis)).max(1)
    }

    fn submit(&self, in_ticks: u64, every: Option<u64>, remaining: Option<u64>, job: TickJob) {
        self.inbox.push(QueuedTask {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            run_at: self.current_tick() + in_ticks,
            every,
            remaining,
            job,
        });
    }

    /// Spawns the tick loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(
            &mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let stop_rx = self.stop_tx.subscribe();
        let scheduler = self.clone();
        let handle = tokio::spawn(scheduler.run_loop(hooks, stop_rx));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stops the loop: jobs already due at the stop tick still run, the
    /// rest are dropped.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "tick loop ended abnormally");
            }
        }
    }

    async fn run_loop(self: Arc<Self>, mut hooks: Vec<TickJob>, mut stop_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.tick_millis));
        // An overrunning tick makes the interval fire again immediately
        // instead of dropping the missed slot.
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut queue: BinaryHeap<Reverse<QueuedTask>> = BinaryHeap::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = Instant::now();
                    let tick = self.current_tick.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = self.events.send(TickEvent { tick });
                    for hook in &mut hooks {
                        hook().await;
                    }
                    self.drain_inbox(&mut queue);
                    run_due(&mut queue, tick).await;
                    self.record_tick_time(started.elapsed());
                }
                _ = stop_rx.changed() => {
                    let tick = self.current_tick();
                    self.drain_inbox(&mut queue);
                    run_due(&mut queue, tick).await;
                    if !queue.is_empty() {
                        debug!(dropped = queue.len(), "dropping jobs scheduled past shutdown");
                    }
                    break;
                }
            }
        }
    }

    fn drain_inbox(&self, queue: &mut BinaryHeap<Reverse<QueuedTask>>) {
        while let Some(task) = self.inbox.pop() {
            queue.push(Reverse(task));
        }
    }

    fn record_tick_time(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let previous = f64::from_bits(self.average_tick.load(Ordering::SeqCst));
        let next = previous * (1.0 - TICK_TIME_ALPHA) + sample * TICK_TIME_ALPHA;
        self.average_tick.store(next.to_bits(), Ordering::SeqCst);
    }
}

async fn run_due(queue: &mut BinaryHeap<Reverse<QueuedTask>>, tick: u64) {
    while queue
        .peek()
        .map(|Reverse(task)| task.run_at <= tick)
        .unwrap_or(false)
    {
        let Some(Reverse(mut task)) = queue.pop() else {
            break;
        };
        (task.job)().await;
        if let Some(every) = task.every {
            let keep = match task.remaining.as_mut() {
                Some(remaining) => {
                    *remaining -= 1;
                    *remaining > 0
                }
                None => true,
            };
            if keep {
                task.run_at = tick + every;
                queue.push(Reverse(task));
            }
        }
    }
}
