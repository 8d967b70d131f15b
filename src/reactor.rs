//! Single-threaded readiness multiplexer built directly on Linux epoll.
//!
//! One dedicated thread owns the epoll instance and drives the loop in [`run`]. Everything else
//! (registration, timer scheduling) may be called from any thread; the loop itself only ever
//! runs on the Reactor's own thread. At most one pending waker is tracked per descriptor, full
//! stop -- registering write interest on a descriptor that already has a pending read waker
//! replaces it, exactly as registering a second read would. A descriptor with two outstanding
//! suspensions racing each other is a programmer error this reactor does not try to support.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::task::Waker;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::error::{Error, Result};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Readiness interest bits, named after the epoll events they map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);

    fn bits(self) -> u32 {
        self.0
    }
}

struct Registration {
    mask: u32,
    waker: Option<Waker>,
}

struct TimerEntry {
    callback: Box<dyn FnOnce() + Send>,
}

struct Inner {
    epoll_fd: RawFd,
    sources: Mutex<HashMap<RawFd, Registration>>,
    ready: Mutex<VecDeque<Waker>>,
    timers: Mutex<BTreeMap<(Instant, u64), TimerEntry>>,
    timer_ids: Mutex<HashMap<u64, Instant>>,
    next_timer_id: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
}

/// A process-wide handle to the Reactor. Cheap to clone (it's a reference to the single global
/// instance); all operations are safe to call from any thread.
#[derive(Clone)]
pub struct Reactor {
    inner: &'static Inner,
}

static GLOBAL: OnceLock<Inner> = OnceLock::new();

/// Opaque identity for a registered timer, returned by [`Reactor::after`] and accepted by
/// [`Reactor::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl Reactor {
    /// Returns the single process-wide Reactor, creating (but not starting) it on first call.
    pub fn handle() -> Reactor {
        let inner = GLOBAL.get_or_init(|| {
            let epoll_fd = unsafe { libc::epoll_create1(0) };
            if epoll_fd < 0 {
                panic!(
                    "epoll_create1 failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            Inner {
                epoll_fd,
                sources: Mutex::new(HashMap::new()),
                ready: Mutex::new(VecDeque::new()),
                timers: Mutex::new(BTreeMap::new()),
                timer_ids: Mutex::new(HashMap::new()),
                next_timer_id: AtomicU64::new(0),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }
        });
        Reactor { inner }
    }

    /// Spawns the dedicated thread that drives [`run`]. Idempotent: calling this more than once
    /// after the first successful spawn has no additional effect beyond returning a handle.
    pub fn spawn_thread() -> Reactor {
        let reactor = Reactor::handle();
        if reactor
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return reactor;
        }
        let driven = reactor.clone();
        std::thread::Builder::new()
            .name("reedux-reactor".into())
            .spawn(move || driven.run())
            .expect("failed to spawn reactor thread");
        reactor
    }

    /// Registers (or replaces) the waker woken the next time `fd` becomes readable.
    pub fn register_read(&self, fd: RawFd, waker: Waker) -> Result<()> {
        self.register(fd, Interest::READABLE, waker)
    }

    /// Registers (or replaces) the waker woken the next time `fd` becomes writable.
    pub fn register_write(&self, fd: RawFd, waker: Waker) -> Result<()> {
        self.register(fd, Interest::WRITABLE, waker)
    }

    /// Registers `waker` as the single pending continuation for `fd`, interested in `interest`.
    /// A still-live waker from a previous registration -- for this direction or the other one --
    /// is dropped, never queued alongside the new one.
    fn register(&self, fd: RawFd, interest: Interest, waker: Waker) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(Error::ReactorStopped);
        }

        let mut sources = self.inner.sources.lock().unwrap();
        let existing = sources.contains_key(&fd);
        let reg = sources.entry(fd).or_insert_with(|| Registration {
            mask: 0,
            waker: None,
        });

        if reg.waker.replace(waker).is_some() {
            warn!("registration replaced a still-live waker for fd {fd}");
        }
        reg.mask = interest.bits();

        let mut event = libc::epoll_event {
            events: reg.mask | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let op = if existing {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let rc = unsafe { libc::epoll_ctl(self.inner.epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            error!("epoll_ctl failed for fd {fd}: {err}");
            return Err(Error::ReactorRegistrationFailed(err));
        }
        trace!("registered fd {fd} for {interest:?} (mask now {:#x})", reg.mask);
        Ok(())
    }

    /// Removes `fd` from the epoll set entirely. Safe to call even if `fd` was never
    /// registered.
    pub fn deregister(&self, fd: RawFd) {
        let mut sources = self.inner.sources.lock().unwrap();
        if sources.remove(&fd).is_some() {
            unsafe {
                libc::epoll_ctl(self.inner.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
            trace!("deregistered fd {fd}");
        }
    }

    /// Schedules `callback` to run on the Reactor thread once `delay` has elapsed. Returns an
    /// id that can be passed to [`Reactor::cancel`].
    pub fn after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        self.inner.timers.lock().unwrap().insert(
            (deadline, id),
            TimerEntry {
                callback: Box::new(callback),
            },
        );
        self.inner.timer_ids.lock().unwrap().insert(id, deadline);
        TimerId(id)
    }

    /// Cancels a timer. Idempotent: cancelling an unknown or already-fired id is a no-op.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.try_cancel(id);
    }

    /// Removes a timer by id, surfacing [`Error::TimerNotFound`] when it was already fired or
    /// never existed. The public [`Reactor::cancel`] treats that case as a benign no-op; this is
    /// exposed separately so it can be asserted on directly.
    pub(crate) fn try_cancel(&self, id: TimerId) -> Result<()> {
        let mut ids = self.inner.timer_ids.lock().unwrap();
        match ids.remove(&id.0) {
            Some(deadline) => {
                self.inner.timers.lock().unwrap().remove(&(deadline, id.0));
                Ok(())
            }
            None => Err(Error::TimerNotFound),
        }
    }

    /// The event loop body. Runs until a fatal `epoll_wait` error. Exposed for the reactor's own
    /// tests, which drive a handful of iterations directly rather than spawning a thread.
    pub fn run(&self) {
        self.inner.running.store(true, Ordering::Release);
        loop {
            self.drain_ready();
            let timeout = self.fire_due_timers_and_next_timeout();

            let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
            let timeout_ms = timeout
                .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
                .unwrap_or(DEFAULT_POLL_TIMEOUT.as_millis() as i32);
            let n = unsafe {
                libc::epoll_wait(
                    self.inner.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as i32,
                    timeout_ms,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("epoll_wait failed fatally, stopping reactor loop: {err}");
                self.inner.running.store(false, Ordering::Release);
                self.inner.stopped.store(true, Ordering::Release);
                return;
            }
            self.dispatch_ready_events(&events[..n as usize]);
        }
    }

    fn drain_ready(&self) {
        let batch: Vec<Waker> = {
            let mut ready = self.inner.ready.lock().unwrap();
            ready.drain(..).collect()
        };
        for waker in batch {
            waker.wake();
        }
    }

    fn fire_due_timers_and_next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        let due: Vec<((Instant, u64), TimerEntry)> = {
            let mut timers = self.inner.timers.lock().unwrap();
            let mut due = Vec::new();
            loop {
                let key = match timers.keys().next() {
                    Some(&key) if key.0 <= now => key,
                    _ => break,
                };
                if let Some(entry) = timers.remove(&key) {
                    due.push((key, entry));
                }
            }
            due
        };
        for (key, entry) in due {
            self.inner.timer_ids.lock().unwrap().remove(&key.1);
            (entry.callback)();
        }
        let timers = self.inner.timers.lock().unwrap();
        timers
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }

    fn dispatch_ready_events(&self, events: &[libc::epoll_event]) {
        let mut sources = self.inner.sources.lock().unwrap();
        let mut to_wake = Vec::new();
        for ev in events {
            let fd = ev.u64 as RawFd;
            if let Some(reg) = sources.get_mut(&fd) {
                let urgent = (libc::EPOLLERR as u32) | (libc::EPOLLHUP as u32);
                let matches_pending_interest = ev.events & reg.mask != 0 || ev.events & urgent != 0;
                if matches_pending_interest {
                    // Taken at most once per descriptor per batch -- a single fd appearing
                    // twice in one `epoll_wait` result only ever has one waker to hand back.
                    if let Some(w) = reg.waker.take() {
                        to_wake.push(w);
                    }
                }
            } else {
                debug!("epoll event for unregistered fd {fd}, ignoring");
            }
        }
        drop(sources);
        let mut ready = self.inner.ready.lock().unwrap();
        ready.extend(to_wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::task::Wake;

    struct FlagWaker(std::sync::atomic::AtomicBool);
    impl Wake for FlagWaker {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn timer_fires_in_deadline_order_not_registration_order() {
        let _ = env_logger::try_init();
        let reactor = Reactor::handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        reactor.after(Duration::from_millis(50), move || order_a.lock().unwrap().push('A'));
        reactor.after(Duration::from_millis(5), move || order_b.lock().unwrap().push('B'));
        std::thread::sleep(Duration::from_millis(80));
        reactor.fire_due_timers_and_next_timeout();
        assert_eq!(*order.lock().unwrap(), vec!['B', 'A']);
    }

    #[test]
    fn cancel_is_idempotent() {
        let reactor = Reactor::handle();
        let id = reactor.after(Duration::from_secs(10), || {});
        reactor.cancel(id);
        reactor.cancel(id);
    }

    #[test]
    fn try_cancel_surfaces_timer_not_found_for_an_unknown_id() {
        let reactor = Reactor::handle();
        let id = reactor.after(Duration::from_secs(10), || {});
        assert!(reactor.try_cancel(id).is_ok());
        assert!(matches!(reactor.try_cancel(id), Err(Error::TimerNotFound)));
    }

    #[test]
    fn pipe_read_interest_only_wakes_after_a_byte_is_written() {
        let _ = env_logger::try_init();
        let reactor = Reactor::handle();
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);
        unsafe {
            libc::fcntl(read_fd, libc::F_SETFL, libc::O_NONBLOCK);
        }

        let flag = Arc::new(FlagWaker(std::sync::atomic::AtomicBool::new(false)));
        let waker: Waker = flag.clone().into();
        reactor.register_read(read_fd, waker).unwrap();
        assert!(!flag.0.load(Ordering::SeqCst));

        let byte = [1u8];
        unsafe {
            libc::write(write_fd, byte.as_ptr() as *const _, 1);
        }

        // Drive one iteration of dispatch manually rather than spawning the full loop thread.
        let mut events: [libc::epoll_event; 4] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(reactor.inner.epoll_fd, events.as_mut_ptr(), 4, 1000)
        };
        assert!(n >= 1);
        reactor.dispatch_ready_events(&events[..n as usize]);
        reactor.drain_ready();
        assert!(flag.0.load(Ordering::SeqCst));

        reactor.deregister(read_fd);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn at_most_one_pending_waker_per_descriptor_same_direction() {
        let reactor = Reactor::handle();
        let fds = unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK);
            assert!(fd >= 0);
            fd
        };
        let flag_a = Arc::new(FlagWaker(std::sync::atomic::AtomicBool::new(false)));
        let flag_b = Arc::new(FlagWaker(std::sync::atomic::AtomicBool::new(false)));
        reactor.register_read(fds, flag_a.clone().into()).unwrap();
        // Replacing before the first ever fires should only leave flag_b live.
        reactor.register_read(fds, flag_b.clone().into()).unwrap();
        let sources = reactor.inner.sources.lock().unwrap();
        let reg = sources.get(&fds).unwrap();
        assert!(reg.waker.is_some());
        drop(sources);
        reactor.deregister(fds);
        unsafe {
            libc::close(fds);
        }
    }

    #[test]
    fn registering_write_interest_replaces_a_pending_read_waker_on_the_same_fd() {
        let reactor = Reactor::handle();
        let fds = unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK);
            assert!(fd >= 0);
            fd
        };
        let read_flag = Arc::new(FlagWaker(std::sync::atomic::AtomicBool::new(false)));
        let write_flag = Arc::new(FlagWaker(std::sync::atomic::AtomicBool::new(false)));
        reactor.register_read(fds, read_flag.clone().into()).unwrap();
        // A second registration for the *other* direction on the same fd still evicts the first
        // -- exactly one continuation is live per descriptor, never one per direction.
        reactor.register_write(fds, write_flag.clone().into()).unwrap();

        let sources = reactor.inner.sources.lock().unwrap();
        let reg = sources.get(&fds).unwrap();
        assert!(reg.waker.is_some());
        assert_eq!(reg.mask, Interest::WRITABLE.bits());
        drop(sources);

        reactor.deregister(fds);
        unsafe {
            libc::close(fds);
        }
    }
}
