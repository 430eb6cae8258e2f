//! Throttled single-consumer execution queue.
//!
//! Jobs run in insertion order, at most one per `min_interval`. A driver task
//! ticks every [`TICK`] while the queue is running; the callback is always
//! invoked outside the queue lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Driver tick period.
pub const TICK: Duration = Duration::from_millis(100);

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct QueueState<T> {
    pending: VecDeque<T>,
    last_run: Option<Instant>,
    driver: Option<JoinHandle<()>>,
}

struct QueueInner<T> {
    state: Mutex<QueueState<T>>,
    min_interval: Duration,
    callback: Callback<T>,
}

impl<T> QueueInner<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the oldest job if the queue is running and the interval elapsed.
    fn tick(&self) {
        let job = {
            let mut state = self.lock();
            if state.driver.is_none() {
                return;
            }
            if state
                .last_run
                .is_some_and(|last| last.elapsed() < self.min_interval)
            {
                return;
            }
            let Some(job) = state.pending.pop_front() else {
                return;
            };
            state.last_run = Some(Instant::now());
            job
        };
        (self.callback)(job);
    }
}

/// Cloneable handle to a throttled queue.
pub struct JobQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> JobQueue<T> {
    pub fn new(min_interval: Duration, callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    last_run: None,
                    driver: None,
                }),
                min_interval,
                callback: Arc::new(callback),
            }),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.inner.min_interval
    }

    /// Append a job. A running, previously empty queue ticks right away.
    pub fn add_job(&self, job: T) {
        let tick_now = {
            let mut state = self.inner.lock();
            state.pending.push_back(job);
            state.driver.is_some() && state.pending.len() == 1
        };
        if tick_now {
            self.inner.tick();
        }
    }

    /// Start the driver and tick immediately. Must be called within a tokio
    /// runtime. Starting a running queue is a no-op.
    pub fn start(&self) {
        {
            let mut state = self.inner.lock();
            if state.driver.is_some() {
                return;
            }
            state.driver = Some(tokio::spawn(drive(Arc::downgrade(&self.inner))));
        }
        tracing::debug!(pending = self.size(), "Job queue started");
        self.inner.tick();
    }

    /// Stop ticking. Pending jobs stay queued; a callback already running
    /// finishes normally.
    pub fn stop(&self) {
        let driver = self.inner.lock().driver.take();
        if let Some(driver) = driver {
            driver.abort();
            tracing::debug!(pending = self.size(), "Job queue stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().driver.is_some()
    }

    /// Number of jobs not yet handed to the callback.
    pub fn size(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

async fn drive<T>(inner: Weak<QueueInner<T>>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.tick();
    }
}
