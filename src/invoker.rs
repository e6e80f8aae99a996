//! Cross-thread invocation onto the UI thread.
//!
//! The UI thread owns a [`UiReceiver`] and pumps it from its cooperative run
//! loop. Any other thread holds a [`UiInvoker`] and either fires work at the
//! UI thread (`post_async`) or posts and blocks until the result is published
//! (`post_sync_wait`). Work runs with a shared reference to the UI-thread
//! context `C`, which never leaves the UI thread.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::errors::{MonkeyError, MonkeyResult};

pub type UiTask<C> = Box<dyn FnOnce(&C) + Send + 'static>;

/// Longest sleep while the UI thread waits on its own queue for a result.
const SELF_WAIT_SLICE: Duration = Duration::from_millis(10);

struct Shared<C> {
    queue: Mutex<VecDeque<UiTask<C>>>,
    available: Condvar,
    ready: AtomicBool,
    closed: AtomicBool,
    ui_thread: OnceLock<ThreadId>,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<UiTask<C>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `closed` is only read and written under the queue lock, so a push
    /// either lands before the receiver drains the queue or is refused.
    fn push(&self, task: UiTask<C>) -> bool {
        let mut queue = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        queue.push_back(task);
        drop(queue);
        self.available.notify_one();
        true
    }

    fn on_ui_thread(&self) -> bool {
        self.ui_thread.get() == Some(&thread::current().id())
    }
}

/// Posting side; cheap to clone and usable from any thread.
pub struct UiInvoker<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for UiInvoker<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: 'static> Default for UiInvoker<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> UiInvoker<C> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                ui_thread: OnceLock::new(),
            }),
        }
    }

    /// Binds the receiving end to the calling thread, which becomes the UI
    /// thread for this invoker. Sets the ready flag exactly once.
    pub fn register_receiver(&self) -> MonkeyResult<UiReceiver<C>> {
        self.shared
            .ui_thread
            .set(thread::current().id())
            .map_err(|_| MonkeyError::Invoker("UI receiver is already registered".into()))?;
        self.shared.ready.store(true, Ordering::Release);
        tracing::debug!(thread = ?thread::current().id(), "UI receiver registered");
        Ok(UiReceiver {
            shared: Arc::clone(&self.shared),
            _not_send: PhantomData,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Spins until the receiver has registered itself.
    pub fn wait_ready(&self) {
        while !self.is_ready() {
            std::hint::spin_loop();
            thread::yield_now();
        }
    }

    /// Queues `f` on the UI thread and returns immediately.
    /// Work is silently dropped once the receiver is gone.
    pub fn post_async<F>(&self, f: F)
    where
        F: FnOnce(&C) + Send + 'static,
    {
        self.wait_ready();
        if !self.shared.push(Box::new(f)) {
            tracing::debug!("UI receiver closed, dropping posted work");
        }
    }

    /// Queues `f` on the UI thread and blocks until it has run.
    ///
    /// Returns `Ok(None)` when `timeout` elapses first; `f` may still run
    /// afterwards and its result is thrown away. Refuses to run on the UI
    /// thread itself, where waiting would deadlock; use
    /// [`UiReceiver::run_sync`] there.
    pub fn post_sync_wait<F, R>(&self, f: F, timeout: Option<Duration>) -> MonkeyResult<Option<R>>
    where
        F: FnOnce(&C) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.wait_ready();
        if self.shared.on_ui_thread() {
            return Err(MonkeyError::Invoker(
                "post_sync_wait called on the UI thread".into(),
            ));
        }

        let (tx, rx) = mpsc::sync_channel::<R>(1);
        let pushed = self.shared.push(Box::new(move |ctx: &C| {
            // The waiter may have timed out already.
            let _ = tx.send(f(ctx));
        }));
        if !pushed {
            return Ok(None);
        }

        let received = match timeout {
            None => rx.recv().ok(),
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(value) => Some(value),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!(?timeout, "post_sync_wait timed out");
                    None
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        Ok(received)
    }
}

/// UI-thread end of the queue. Not `Send`: it must be pumped on the thread
/// that registered it.
pub struct UiReceiver<C> {
    shared: Arc<Shared<C>>,
    _not_send: PhantomData<*const ()>,
}

impl<C: 'static> UiReceiver<C> {
    /// Runs queued work until the queue is empty or `max_time` has elapsed.
    /// Does not wait when nothing is queued. Returns the number of tasks run.
    pub fn process_events(&self, ctx: &C, max_time: Duration) -> usize {
        let deadline = Instant::now() + max_time;
        let mut ran = 0;
        loop {
            let task = self.shared.lock().pop_front();
            match task {
                Some(task) => {
                    task(ctx);
                    ran += 1;
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                None => break,
            }
        }
        ran
    }

    /// Waits up to `max_time` for work to arrive, then processes what is
    /// queued within the remaining time.
    pub fn wait_events(&self, ctx: &C, max_time: Duration) -> usize {
        let deadline = Instant::now() + max_time;
        {
            let mut queue = self.shared.lock();
            while queue.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    return 0;
                }
                queue = self
                    .shared
                    .available
                    .wait_timeout(queue, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
        self.process_events(ctx, deadline.saturating_duration_since(Instant::now()))
    }

    /// Synchronous invoke from the UI thread: queues `f` behind pending work
    /// and pumps the queue until `f` has produced its result or `timeout`
    /// elapses.
    pub fn run_sync<F, R>(&self, ctx: &C, f: F, timeout: Option<Duration>) -> Option<R>
    where
        F: FnOnce(&C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<R>(1);
        self.shared.lock().push_back(Box::new(move |ctx: &C| {
            let _ = tx.send(f(ctx));
        }));

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Ok(value) = rx.try_recv() {
                return Some(value);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(?timeout, "run_sync timed out");
                        return None;
                    }
                    (deadline - now).min(SELF_WAIT_SLICE)
                }
                None => SELF_WAIT_SLICE,
            };
            self.wait_events(ctx, slice);
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().len()
    }
}

impl<C> Drop for UiReceiver<C> {
    fn drop(&mut self) {
        let dropped = {
            let mut queue = self.shared.lock();
            self.shared.closed.store(true, Ordering::Release);
            std::mem::take(&mut *queue)
        };
        // Dropping queued work wakes every post_sync_wait still blocked on it.
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropping unprocessed UI work");
        }
    }
}
