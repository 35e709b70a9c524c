use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{Scheduler, TimerFired, TimerHandle, TimerKey};
use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scheduler backed by tokio sleeps
///
/// Each armed timer is a spawned task that sleeps and then delivers a
/// [`TimerFired`] on the channel returned by [`TokioScheduler::new`].
/// Cancelling aborts the task.
#[derive(Clone)]
pub struct TokioScheduler {
    inner: Arc<TokioSchedulerInner>,
}

struct TokioSchedulerInner {
    runtime: Handle,
    next_handle: AtomicU64,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    tasks: Arc<Mutex<HashMap<TimerHandle, JoinHandle<()>>>>,
}

impl TokioScheduler {
    /// Creates a scheduler on the current tokio runtime.
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<TimerFired>)> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("TokioScheduler needs a tokio runtime: {}", e)))?;
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = TokioScheduler {
            inner: Arc::new(TokioSchedulerInner {
                runtime,
                next_handle: AtomicU64::new(1),
                fired_tx,
                tasks: Arc::new(Mutex::new(HashMap::new())),
            }),
        };
        Ok((scheduler, fired_rx))
    }

    /// Number of timers still waiting to fire.
    pub fn pending(&self) -> usize {
        lock(&self.inner.tasks).len()
    }
}

impl Scheduler for TokioScheduler {
    fn arm(&self, key: TimerKey, after: Duration) -> TimerHandle {
        let handle = TimerHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let fired_tx = self.inner.fired_tx.clone();
        let tasks = self.inner.tasks.clone();

        // Held across the spawn so the task cannot remove itself before it is recorded
        let mut pending = lock(&self.inner.tasks);
        let task = self.inner.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            lock(&tasks).remove(&handle);
            if fired_tx.send(TimerFired { key, handle }).is_err() {
                debug!("Timer receiver dropped, discarding firing");
            }
        });
        pending.insert(handle, task);
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = lock(&self.inner.tasks).remove(&handle) {
            trace!(handle = handle.0, "Cancelling timer");
            task.abort();
        }
    }
}

/// Deterministic scheduler driven by a virtual clock
///
/// Nothing fires on its own. [`ManualScheduler::advance`] moves the clock
/// forward and hands every timer that became due to a callback, in due-time
/// order. Timers armed from inside the callback are measured from the firing
/// time and fire within the same call when they fall inside the window.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_handle: u64,
    pending: Vec<(Duration, TimerHandle, TimerKey)>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        lock(&self.inner).now
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Armed timers with their remaining time, soonest first.
    pub fn armed(&self) -> Vec<(TimerKey, Duration)> {
        let state = lock(&self.inner);
        let mut armed: Vec<_> = state
            .pending
            .iter()
            .map(|(deadline, handle, key)| (*deadline, *handle, key.clone()))
            .collect();
        armed.sort_by_key(|(deadline, handle, _)| (*deadline, *handle));
        armed
            .into_iter()
            .map(|(deadline, _, key)| (key, deadline.saturating_sub(state.now)))
            .collect()
    }

    /// Moves the clock forward by `by`, delivering due timers to `on_fire`.
    pub fn advance(&self, by: Duration, mut on_fire: impl FnMut(TimerFired)) {
        let target = lock(&self.inner).now + by;
        while let Some(fired) = self.pop_due(target) {
            on_fire(fired);
        }
        let mut state = lock(&self.inner);
        if state.now < target {
            state.now = target;
        }
    }

    fn pop_due(&self, target: Duration) -> Option<TimerFired> {
        let mut state = lock(&self.inner);
        let index = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, (deadline, _, _))| *deadline <= target)
            .min_by_key(|(_, (deadline, handle, _))| (*deadline, *handle))
            .map(|(index, _)| index)?;
        let (deadline, handle, key) = state.pending.remove(index);
        state.now = deadline;
        Some(TimerFired { key, handle })
    }
}

impl Scheduler for ManualScheduler {
    fn arm(&self, key: TimerKey, after: Duration) -> TimerHandle {
        let mut state = lock(&self.inner);
        state.next_handle += 1;
        let handle = TimerHandle(state.next_handle);
        let deadline = state.now + after;
        state.pending.push((deadline, handle, key));
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        lock(&self.inner).pending.retain(|(_, h, _)| *h != handle);
    }
}
