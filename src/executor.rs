//! A fixed-size worker pool driving [`crate::task::Task`] bodies to completion.
//!
//! The queue is exactly the mechanism spec'd for this kind of pool: a single shared FIFO guarded
//! by a `Mutex`, workers parked on a `Condvar` until there's something to do. No work stealing,
//! no per-worker queues, no priority -- a submitted closure runs on whichever worker pops it
//! next, to completion, uninterrupted.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::task::{Context as PollContext, Poll, Waker};
use std::thread::{self, JoinHandle as ThreadJoinHandle};

use log::{debug, error};

use crate::error::{panic_message, Error, Result};
use crate::task::Task;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    signal: Condvar,
    shutting_down: AtomicBool,
}

/// A running worker pool. Cloning is cheap (it's a handle around an `Arc`); dropping the last
/// handle does not shut the pool down -- call [`Executor::shutdown`] explicitly.
#[derive(Clone)]
pub struct Executor {
    queue: Arc<Queue>,
    workers: Arc<Mutex<Vec<ThreadJoinHandle<()>>>>,
}

/// Configures and spawns an [`Executor`].
pub struct Builder {
    worker_count: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            worker_count: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn build(self) -> Executor {
        Executor::with_worker_count(self.worker_count)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

impl Executor {
    /// An executor sized to `std::thread::available_parallelism()`.
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A process-wide, lazily-started executor sized to `available_parallelism()`. Used by
    /// [`crate::fs`]'s blocking-I/O wrappers so callers don't need to thread an `Executor`
    /// through every file operation.
    pub fn global() -> &'static Executor {
        static GLOBAL: OnceLock<Executor> = OnceLock::new();
        GLOBAL.get_or_init(Executor::new)
    }

    fn with_worker_count(n: usize) -> Self {
        let queue = Arc::new(Queue {
            jobs: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(n);
        for idx in 0..n {
            let queue = queue.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("reedux-worker-{idx}"))
                    .spawn(move || worker_loop(queue))
                    .expect("failed to spawn executor worker thread"),
            );
        }

        Executor {
            queue,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Submits an opaque closure to run on some worker. Silently dropped (and logged at
    /// `debug!`) if the pool has already been shut down. Use [`Executor::try_submit`] when the
    /// caller needs to distinguish that case from success.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.try_submit(job).is_err() {
            debug!("dropping submission after executor shutdown");
        }
    }

    /// Submits an opaque closure to run on some worker, returning [`Error::ExecutorShutDown`]
    /// instead of silently discarding the closure if the pool has already been shut down.
    pub fn try_submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.queue.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ExecutorShutDown);
        }
        let mut jobs = self.queue.jobs.lock().unwrap();
        jobs.push_back(Box::new(job));
        self.queue.signal.notify_one();
        Ok(())
    }

    /// Suspends the calling task, resuming it on this executor's own queue rather than wherever
    /// it happens to be polled from. On first poll it submits a closure that wakes the task and
    /// returns `Pending`; on the second poll it returns `Ready(())`. Must not be awaited from
    /// inside the synchronous drive loop that is currently polling the very task calling it --
    /// that loop (`run_on_executor`'s worker closure, or `sync_wait`) is what's supposed to
    /// observe the resubmission, and a task can't submit itself to a queue that's waiting on it
    /// to finish.
    pub fn yield_to_executor(&self) -> YieldToExecutor {
        YieldToExecutor {
            executor: self.clone(),
            yielded: false,
        }
    }

    /// Adopts `task`, drives it to completion on a worker, and returns a [`JoinHandle`] that
    /// resolves to its result. See the module-level anchor pattern: the `Arc<Shared<T>>` keeps
    /// the result slot alive independent of whether the worker closure or the `JoinHandle`
    /// outlives the other.
    pub fn run_on_executor<T>(&self, task: Task<T>) -> JoinHandle<T>
    where
        T: Send + 'static,
    {
        let shared = Arc::new(SharedState::<T> {
            state: Mutex::new(SlotState::Pending(Some(task))),
            waker: Mutex::new(None),
            executed: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        self.submit(move || {
            if worker_shared
                .executed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let result = drive_to_completion(&worker_shared);
            let mut state = worker_shared.state.lock().unwrap();
            *state = SlotState::Done(result);
            drop(state);
            if let Some(waker) = worker_shared.waker.lock().unwrap().take() {
                waker.wake();
            }
        });

        JoinHandle { shared }
    }

    /// Fire-and-forget: drives `task` to completion on a worker and discards the result,
    /// logging at `error!` if it failed. Holds no state beyond the submitted closure's own
    /// capture.
    pub fn detach(&self, task: Task<()>) {
        self.submit(move || match crate::task::sync_wait(task) {
            Ok(()) => {}
            Err(e) => error!("detached task failed: {e}"),
        });
    }

    /// Runs a blocking closure on a worker and resolves a [`JoinHandle`] with its result. This
    /// is the vehicle behind [`crate::fs::read_to_vec`]/[`crate::fs::append`]: it consumes a
    /// worker-pool slot for the duration of the call, it is not true asynchronous I/O.
    pub fn spawn_blocking<T, F>(&self, f: F) -> JoinHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let shared = Arc::new(SharedState::<T> {
            state: Mutex::new(SlotState::Pending(None)),
            waker: Mutex::new(None),
            executed: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        self.submit(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload))));
            *worker_shared.state.lock().unwrap() = SlotState::Done(result);
            if let Some(waker) = worker_shared.waker.lock().unwrap().take() {
                waker.wake();
            }
        });
        JoinHandle { shared }
    }

    /// Requests shutdown: no further submissions are accepted, queued-but-not-yet-run jobs are
    /// dropped (never executed), and already-running jobs are allowed to finish. Joins all
    /// worker threads before returning.
    pub fn shutdown(&self) {
        self.queue.shutting_down.store(true, Ordering::Release);
        {
            let mut jobs = self.queue.jobs.lock().unwrap();
            jobs.clear();
        }
        self.queue.signal.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for w in workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new()
    }
}

fn worker_loop(queue: Arc<Queue>) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock().unwrap();
            loop {
                if let Some(job) = jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutting_down.load(Ordering::Acquire) {
                    break None;
                }
                jobs = queue.signal.wait(jobs).unwrap();
            }
        };
        match job {
            Some(job) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!("executor worker caught panic: {}", panic_message(payload));
                }
            }
            None => return,
        }
    }
}

enum SlotState<T> {
    Pending(Option<Task<T>>),
    Done(Result<T>),
    Taken,
}

struct SharedState<T> {
    state: Mutex<SlotState<T>>,
    waker: Mutex<Option<Waker>>,
    executed: AtomicBool,
}

fn drive_to_completion<T>(shared: &SharedState<T>) -> Result<T> {
    let task = {
        let mut state = shared.state.lock().unwrap();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Pending(task) => task,
            other => {
                *state = other;
                None
            }
        }
    };
    match task {
        Some(task) => crate::task::sync_wait(task),
        None => Err(Error::NullFrame),
    }
}

/// A handle to the eventual result of [`Executor::run_on_executor`] or
/// [`Executor::spawn_blocking`]. Itself a future, so it can be `.await`ed from another task.
pub struct JoinHandle<T> {
    shared: Arc<SharedState<T>>,
}

impl<T> std::future::Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock().unwrap();
        match &*state {
            SlotState::Done(_) => {
                if let SlotState::Done(result) = std::mem::replace(&mut *state, SlotState::Taken)
                {
                    Poll::Ready(result)
                } else {
                    unreachable!()
                }
            }
            _ => {
                *self.shared.waker.lock().unwrap() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Future returned by [`Executor::yield_to_executor`]. See that method for the two-poll
/// semantics.
pub struct YieldToExecutor {
    executor: Executor,
    yielded: bool,
}

impl std::future::Future for YieldToExecutor {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut PollContext<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        let waker = cx.waker().clone();
        this.executor.submit(move || waker.wake());
        Poll::Pending
    }
}
