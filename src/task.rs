//! Lazy, move-only units of work.
//!
//! A [`Task<T>`] wraps a boxed, pinned future that yields a `T` or fails with [`crate::Error`].
//! Construction never polls the body -- a `Task` is inert until something drives it, which is
//! this crate's realization of "initial suspend always".
//!
//! Awaiting a `Task` from inside another `Task`'s body is ordinary `.await`, but it is still a
//! call through a `dyn Future` vtable: if the awaited task resolves synchronously (no real
//! suspension anywhere in it), the poll call chains straight through, one native stack frame per
//! nesting level, exactly like any other boxed recursive future in Rust. A handful of levels of
//! that is unremarkable; thousands is not something plain recursive `.await` should be asked to
//! do. For a chain whose length is only known at runtime, use [`iterate`] instead: it represents
//! the whole chain as a loop inside a single `async` body, so the native stack depth stays
//! constant regardless of how many steps run.
//!
//! ```
//! use reedux::task::{Task, sync_wait};
//!
//! fn get() -> Task<i32> {
//!     Task::new(async { Ok(10) })
//! }
//!
//! fn double() -> Task<i32> {
//!     Task::new(async { Ok(get().await? * 2) })
//! }
//!
//! assert_eq!(sync_wait(double()).unwrap(), 20);
//! ```

use std::future::Future;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{panic_message, Error, Result};

/// Opaque identity for a task, stable for the task's lifetime. Used for logging/correlation
/// only; carries no ordering guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

/// A lazy, move-only handle to a unit of async work producing one `T`.
///
/// `Task` itself implements [`Future`], so awaiting one from inside another task's body is
/// ordinary `.await` -- no adapter trait is needed.
pub struct Task<T> {
    inner: Pin<Box<dyn Future<Output = Result<T>> + Send>>,
}

impl<T> Task<T> {
    /// Wraps a future as a `Task`. The future is not polled until the `Task` is driven.
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Task {
            inner: Box::pin(body),
        }
    }

    /// An opaque, stable identity for this task (its boxed future's address on first poll).
    pub fn id(&self) -> TaskId {
        TaskId(self.inner.as_ref().get_ref() as *const _ as *const () as usize)
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// A `Waker` that simply flips a flag and notifies a condvar; used by [`sync_wait`] to park the
/// calling thread between polls instead of busy-looping.
struct ParkWaker {
    state: Mutex<bool>,
    ready: Condvar,
}

impl ParkWaker {
    fn new() -> Arc<Self> {
        Arc::new(ParkWaker {
            state: Mutex::new(false),
            ready: Condvar::new(),
        })
    }

    fn park(&self) {
        let mut woken = self.state.lock().unwrap();
        while !*woken {
            woken = self.ready.wait(woken).unwrap();
        }
        *woken = false;
    }
}

impl Wake for ParkWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut woken = self.state.lock().unwrap();
        *woken = true;
        self.ready.notify_one();
    }
}

/// Drives `task` to completion on the calling thread, parking between polls. Only safe to call
/// on a task whose internal suspensions are eventually woken by something -- the Reactor,
/// another thread, or an immediate re-poll. A task that suspends on a hand that never wakes it
/// deadlocks the caller, same as any other condvar-parked wait.
///
/// Catches a panic inside the task body and converts it into [`Error::Panicked`] rather than
/// letting it unwind through the caller.
pub fn sync_wait<T>(task: Task<T>) -> Result<T> {
    let park = ParkWaker::new();
    let waker: Waker = park.clone().into();
    let mut cx = Context::from_waker(&waker);
    let mut task = Box::pin(task);

    loop {
        let poll = panic::catch_unwind(AssertUnwindSafe(|| task.as_mut().poll(&mut cx)));
        match poll {
            Ok(Poll::Ready(result)) => return result,
            Ok(Poll::Pending) => park.park(),
            Err(payload) => return Err(Error::Panicked(panic_message(payload))),
        }
    }
}

/// Drives a sequence of steps derived one from the next, as a flat loop inside a single `Task`
/// rather than as nested recursive `.await`s. `step` is called with the current state and must
/// return whether to continue with a new state or stop with a final value. Because every
/// iteration reuses the same `async` stack frame (it is a `loop`, not a recursive function call),
/// native stack usage does not grow with the number of steps, however many there are.
pub fn iterate<S, T, F, Fut>(initial: S, mut step: F) -> Task<T>
where
    S: Send + 'static,
    T: Send + 'static,
    F: FnMut(S) -> Fut + Send + 'static,
    Fut: Future<Output = Result<ControlFlow<T, S>>> + Send + 'static,
{
    Task::new(async move {
        let mut state = initial;
        loop {
            match step(state).await? {
                ControlFlow::Break(value) => return Ok(value),
                ControlFlow::Continue(next) => state = next,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_nested_tasks_in_one_sync_wait() {
        fn get() -> Task<i32> {
            Task::new(async { Ok(10) })
        }
        fn double() -> Task<i32> {
            Task::new(async { Ok(get().await? * 2) })
        }
        assert_eq!(sync_wait(double()).unwrap(), 20);
    }

    #[test]
    fn propagates_body_error() {
        let task: Task<i32> = Task::new(async { Err(Error::GeneratorExhausted) });
        assert!(matches!(sync_wait(task), Err(Error::GeneratorExhausted)));
    }

    #[test]
    fn catches_panic_in_body() {
        let task: Task<i32> = Task::new(async { panic!("boom") });
        match sync_wait(task) {
            Err(Error::Panicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[test]
    fn iterate_runs_ten_thousand_steps_without_growing_native_stack() {
        // Each step here is its own `Task`, but `iterate` awaits them one at a time inside a
        // loop rather than nesting them inside one another, so this does not recurse on the
        // native stack no matter how large the count gets.
        let chain = iterate(0u64, |count| async move {
            if count == 10_000 {
                Ok(ControlFlow::Break(count))
            } else {
                let next = Task::new(async move { Ok(count + 1) }).await?;
                Ok(ControlFlow::Continue(next))
            }
        });
        assert_eq!(sync_wait(chain).unwrap(), 10_000);
    }

    #[test]
    fn distinct_tasks_have_distinct_ids() {
        let a: Task<i32> = Task::new(async { Ok(1) });
        let b: Task<i32> = Task::new(async { Ok(2) });
        assert_ne!(a.id(), b.id());
    }
}
