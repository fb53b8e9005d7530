//! Flushing of the log to disk.
//!
//! A [`DirectFlusher`] syncs on every call. A [`DelayedFlusher`] coalesces calls into
//! one pending task on a [`Scheduler`], so a burst of appends costs a single fsync.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, trace, warn};

use crate::{
    error::{ErrorHandler, ErrorSeverity, LogError, LogResult},
    storage::meta::FlushMetaStore,
};

/// Default interval of the delayed flusher.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_secs(5);

/// The storage backend a flusher syncs.
pub trait Journal: Send + Sync {
    fn is_open(&self) -> bool;
    fn last_index(&self) -> u64;
    fn flush(&self) -> LogResult<()>;
}

pub type ScheduledTask = Box<dyn Fn() + Send + Sync>;

pub trait Cancellable: Send + Sync {
    fn cancel(&self);
    fn is_done(&self) -> bool;
}

pub trait Scheduler: Send + Sync {
    /// Runs `task` after `initial_delay` and then every `interval` until cancelled.
    ///
    /// Implementations must not run the task from inside this call.
    fn schedule(
        &self,
        initial_delay: Duration,
        interval: Duration,
        task: ScheduledTask,
    ) -> Box<dyn Cancellable>;
}

pub trait Flusher: Send + Sync {
    /// Requests that everything appended to `journal` so far becomes durable and
    /// that its last index is recorded in `meta`.
    fn flush(&self, journal: &Arc<dyn Journal>, meta: &Arc<dyn FlushMetaStore>)
    -> LogResult<()>;

    /// True when [`Flusher::flush`] is durable once it returns.
    fn is_direct(&self) -> bool;

    /// After close no further flush runs, including one already scheduled.
    fn close(&self);
}

fn flush_journal(journal: &Arc<dyn Journal>, meta: &Arc<dyn FlushMetaStore>) -> LogResult<()> {
    journal.flush()?;
    let last_index = journal.last_index();
    meta.store_last_flushed_index(last_index)?;
    trace!("Flushed journal up to index {}", last_index);
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFlusher;

impl Flusher for DirectFlusher {
    fn flush(
        &self,
        journal: &Arc<dyn Journal>,
        meta: &Arc<dyn FlushMetaStore>,
    ) -> LogResult<()> {
        flush_journal(journal, meta)
    }

    fn is_direct(&self) -> bool {
        true
    }

    fn close(&self) {}
}

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const CLOSED: u8 = 2;

struct DelayedFlusherInner {
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    state: AtomicU8,
    pending: Mutex<Option<Box<dyn Cancellable>>>,
    // held for the whole flush body so close() can wait out a running flush
    flush_lock: Mutex<()>,
}

impl DelayedFlusherInner {
    fn run_scheduled_flush(&self, journal: &Arc<dyn Journal>, meta: &Arc<dyn FlushMetaStore>) {
        let _guard = self.flush_lock.lock();
        if self.state.load(Ordering::Acquire) == CLOSED {
            debug!("Skipping scheduled flush, flusher is closed");
            return;
        }

        // one flush per schedule
        if let Some(handle) = self.pending.lock().take() {
            handle.cancel();
        }
        if self
            .state
            .compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Skipping scheduled flush, flusher is closed");
            return;
        }

        if !journal.is_open() {
            debug!("Skipping scheduled flush, journal is closed");
            return;
        }

        if let Err(e) = flush_journal(journal, meta) {
            match e.severity() {
                ErrorSeverity::Fatal => error!("Scheduled flush failed: {}", e.context()),
                _ => warn!("Scheduled flush failed: {}", e.context()),
            }
        }
    }
}

/// Flushes at most once per interval, and only after being asked to.
pub struct DelayedFlusher {
    inner: Arc<DelayedFlusherInner>,
}

impl DelayedFlusher {
    pub fn new(scheduler: Arc<dyn Scheduler>, delay: Duration) -> Self {
        Self {
            inner: Arc::new(DelayedFlusherInner {
                scheduler,
                delay,
                state: AtomicU8::new(IDLE),
                pending: Mutex::new(None),
                flush_lock: Mutex::new(()),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == SCHEDULED
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CLOSED
    }
}

impl Flusher for DelayedFlusher {
    fn flush(
        &self,
        journal: &Arc<dyn Journal>,
        meta: &Arc<dyn FlushMetaStore>,
    ) -> LogResult<()> {
        if self
            .inner
            .state
            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("Flush already scheduled or flusher closed");
            return Ok(());
        }

        let weak: Weak<DelayedFlusherInner> = Arc::downgrade(&self.inner);
        let journal = journal.clone();
        let meta = meta.clone();

        // Calls made before the task runs coalesce into it, since the state stays
        // scheduled until then.
        let mut pending = self.inner.pending.lock();
        let handle = self.inner.scheduler.schedule(
            Duration::ZERO,
            self.inner.delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.run_scheduled_flush(&journal, &meta);
                }
            }),
        );

        if self.inner.state.load(Ordering::Acquire) == CLOSED {
            handle.cancel();
            return Ok(());
        }
        *pending = Some(handle);
        trace!("Scheduled flush every {:?}", self.inner.delay);
        Ok(())
    }

    fn is_direct(&self) -> bool {
        false
    }

    fn close(&self) {
        self.inner.state.store(CLOSED, Ordering::Release);
        let _guard = self.inner.flush_lock.lock();
        if let Some(handle) = self.inner.pending.lock().take() {
            handle.cancel();
        }
        debug!("Closed delayed flusher");
    }
}

impl Drop for DelayedFlusher {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.pending.lock().take() {
            handle.cancel();
        }
    }
}

/// Runs scheduled tasks on a tokio runtime. The task itself runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller runs on.
    pub fn current() -> LogResult<Self> {
        Handle::try_current().map(Self::new).map_err(|e| {
            LogError::InvalidConfig(format!(
                "delayed flushing needs a tokio runtime: {}",
                e
            ))
        })
    }
}

struct TokioCancellable {
    abort: AbortHandle,
}

impl Cancellable for TokioCancellable {
    fn cancel(&self) {
        self.abort.abort();
    }

    fn is_done(&self) -> bool {
        self.abort.is_finished()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(
        &self,
        initial_delay: Duration,
        interval: Duration,
        task: ScheduledTask,
    ) -> Box<dyn Cancellable> {
        let task: Arc<dyn Fn() + Send + Sync> = Arc::from(task);
        let period = interval.max(Duration::from_millis(1));

        let join = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let task = task.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                    warn!("Scheduled task failed: {}", e);
                }
            }
        });

        Box::new(TokioCancellable {
            abort: join.abort_handle(),
        })
    }
}
