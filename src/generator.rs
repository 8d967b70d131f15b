//! Stackful, iterable coroutines.
//!
//! Unlike [`crate::task::Task`], a [`Generator`] keeps a genuine second OS stack alive across
//! `yield` points, via the `context` crate's register-context swap. That is what lets a yielded
//! *left-value* (a reference into one of the generator body's own locals) stay valid after
//! control returns to the consumer: the stack holding that local is merely paused, not torn
//! down. A yielded *right-value* (a temporary with no stable address of its own) is instead
//! moved into a promise-owned slot before control returns.
//!
//! ```text
//!           resume                yield_ref / yield_owned
//!   consumer ------>  coroutine stack  ------------------>  consumer
//!           <------                <------
//!             (blocked)               (suspended, stack frozen)
//! ```
//!
//! ```
//! use reedux::generator::Generator;
//!
//! let mut gen = Generator::new(|y| {
//!     let (mut a, mut b) = (0u64, 1u64);
//!     loop {
//!         y.yield_owned(a);
//!         let next = a + b;
//!         a = b;
//!         b = next;
//!     }
//! });
//!
//! let first_eight: Vec<u64> = (0..8).map(|_| *gen.next().unwrap()).collect();
//! assert_eq!(first_eight, vec![0, 1, 1, 2, 3, 5, 8, 13]);
//! ```

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

use context::stack::ProtectedFixedSizeStack;
use context::{Context as FiberContext, Transfer};

use crate::error::{panic_message, Error, Result};

const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Tunables for a `Generator`'s underlying stack.
#[derive(Debug, Clone)]
pub struct Options {
    pub stack_size: usize,
    pub name: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
            name: None,
        }
    }
}

/// Builds a [`Generator`] with non-default [`Options`].
pub struct Builder {
    opts: Options,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            opts: Options::default(),
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.opts.stack_size = size;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.opts.name = Some(name.into());
        self
    }

    pub fn spawn<T, F>(self, body: F) -> Generator<T>
    where
        T: 'static,
        F: FnOnce(&Yield<T>) + Send + 'static,
    {
        Generator::with_options(self.opts, body)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

enum Slot<T> {
    Empty,
    Borrowed(*const T),
    Owned(T),
    Finished,
    Panicked(String),
}

/// The handle passed into a generator body, used to produce values.
pub struct Yield<T> {
    slot: *mut Slot<T>,
    context_box: *mut Option<FiberContext>,
}

impl<T> Yield<T> {
    /// Yields a reference into one of the body's own locals. Valid because the generator's
    /// stack is merely paused across the suspension, not destroyed.
    pub fn yield_ref(&self, value: &T) {
        unsafe {
            *self.slot = Slot::Borrowed(value as *const T);
        }
        self.suspend();
    }

    /// Yields an owned temporary. Moved into a promise-owned slot so it has a stable address
    /// for the consumer to read after control returns.
    pub fn yield_owned(&self, value: T) {
        unsafe {
            *self.slot = Slot::Owned(value);
        }
        self.suspend();
    }

    fn suspend(&self) {
        unsafe {
            let ctx = (*self.context_box).take().expect("fiber context missing");
            let transfer = ctx.resume(0);
            *self.context_box = Some(transfer.context);
        }
    }
}

/// State shared between the consumer and the running fiber, boxed so it has a stable address
/// the trampoline can reach via the `data` word passed through `context::Context::resume`.
struct Shared<T> {
    slot: Slot<T>,
    body: Option<Box<dyn FnOnce(&Yield<T>) + Send>>,
    context_box: Option<FiberContext>,
}

/// A lazy, iterable, stackful coroutine producing a sequence of `T`.
///
/// Initially suspended: the stack is allocated at construction but the body does not run until
/// the first call to [`Generator::next`].
pub struct Generator<T> {
    stack: Option<ProtectedFixedSizeStack>,
    context: Option<FiberContext>,
    shared: *mut Shared<T>,
    started: Cell<bool>,
    done: Cell<bool>,
}

unsafe impl<T: Send> Send for Generator<T> {}

extern "C" fn trampoline<T>(t: Transfer) -> ! {
    let shared = t.data as *mut Shared<T>;
    let body = unsafe { (*shared).body.take().expect("generator body missing") };
    let context_box: *mut Option<FiberContext> = unsafe { &mut (*shared).context_box };

    // The very first `resume` handed us its own continuation in `t.context`; stash it so
    // `Yield::suspend` has something to resume into.
    unsafe {
        *context_box = Some(t.context);
    }

    let y = Yield {
        slot: unsafe { &mut (*shared).slot },
        context_box,
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| body(&y)));
    unsafe {
        match result {
            Ok(()) => (*shared).slot = Slot::Finished,
            Err(payload) => (*shared).slot = Slot::Panicked(panic_message(payload)),
        }
    }

    loop {
        unsafe {
            let ctx = (*context_box).take().expect("fiber context missing");
            let transfer = ctx.resume(0);
            *context_box = Some(transfer.context);
        }
    }
}

impl<T: 'static> Generator<T> {
    /// Spawns a generator with default [`Options`]. The body is not run until the first
    /// [`Generator::next`] call.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&Yield<T>) + Send + 'static,
    {
        Self::with_options(Options::default(), body)
    }

    fn with_options<F>(opts: Options, body: F) -> Self
    where
        F: FnOnce(&Yield<T>) + Send + 'static,
    {
        let stack = ProtectedFixedSizeStack::new(opts.stack_size)
            .expect("failed to allocate generator stack");
        let context = FiberContext::new(&stack, trampoline::<T>);

        let shared = Box::into_raw(Box::new(Shared {
            slot: Slot::Empty,
            body: Some(Box::new(body)),
            context_box: None,
        }));

        let _ = opts.name; // retained for future diagnostics / thread naming parity
        Generator {
            stack: Some(stack),
            context: Some(context),
            shared,
            started: Cell::new(false),
            done: Cell::new(false),
        }
    }

    /// Advances the generator to its next `yield`, returning a reference to the produced value,
    /// or `None` once the body has returned. Each call invalidates the reference returned by the
    /// previous call.
    pub fn next(&mut self) -> Option<&T> {
        if self.done.get() {
            return None;
        }
        self.started.set(true);

        let ctx = self.context.take().expect("generator already running");
        let transfer = unsafe { ctx.resume(self.shared as usize) };
        self.context = Some(transfer.context);

        let shared = unsafe { &mut *self.shared };
        match &shared.slot {
            Slot::Borrowed(ptr) => Some(unsafe { &**ptr }),
            Slot::Owned(v) => Some(v),
            Slot::Finished => {
                self.done.set(true);
                None
            }
            Slot::Panicked(_) => {
                self.done.set(true);
                None
            }
            Slot::Empty => None,
        }
    }

    /// Returns an error if the body panicked, consuming the stored message. `Ok(())` otherwise
    /// (including the "still running" and "never started" cases).
    pub fn check_panic(&self) -> Result<()> {
        let shared = unsafe { &*self.shared };
        match &shared.slot {
            Slot::Panicked(msg) => Err(Error::Panicked(msg.clone())),
            _ => Ok(()),
        }
    }

    /// The current value, or an error if iteration has finished and no further value exists.
    pub fn current(&self) -> Result<&T> {
        let shared = unsafe { &*self.shared };
        match &shared.slot {
            Slot::Borrowed(ptr) => Ok(unsafe { &**ptr }),
            Slot::Owned(v) => Ok(v),
            _ => Err(Error::GeneratorExhausted),
        }
    }
}

impl<T> Drop for Generator<T> {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.shared));
        }
        // `stack`/`context` drop after `shared`; the fiber never runs again once this handle is
        // gone, so there is no remaining borrow into the stack to invalidate.
        let _ = self.stack.take();
        let _ = self.context.take();
    }
}

/// Adapts a `Generator<T>` to `Iterator<Item = T>` by cloning each yielded value out. Useful
/// when the consumer wants ordinary iterator combinators and doesn't need the zero-copy
/// left-value path.
pub struct GenIter<T>(RefCell<Generator<T>>);

impl<T: Clone + 'static> Iterator for GenIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.borrow_mut().next().cloned()
    }
}

impl<T: Clone + 'static> GenIter<T> {
    pub fn new(generator: Generator<T>) -> Self {
        GenIter(RefCell::new(generator))
    }
}
