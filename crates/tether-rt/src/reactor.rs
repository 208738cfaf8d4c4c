use std::io;
use std::mem;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use async_task::Runnable;
use concurrent_queue::ConcurrentQueue;
use polling::{Events, Poller};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::config::{LoopBuilder, LoopConfig};
use crate::handle::{AsyncCb, CloseCb, HandlePtr, RawAsync, FLAG_ACTIVE, FLAG_CLOSED, FLAG_CLOSING};
use crate::status;
use crate::utils::TrivialPair;

/// How long [`Loop::run`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until nothing keeps the loop alive or [`Loop::stop`] is called.
    Default,
    /// Until at least one callback or task ran, blocking for it if needed.
    Once,
    /// One pass over whatever is ready; never blocks.
    NoWait,
}

/// Wake request: (registry key, handle id). The id guards against a key that
/// was freed and reused between the send and the dispatch.
type WakeToken = TrivialPair<usize, u64>;

/// A registered wake handle.
struct Entry {
    handle: HandlePtr,
    id: u64,
    cb: AsyncCb,
}

/// A single-threaded loop that runs wake callbacks, close callbacks and
/// spawned tasks.
///
/// Any thread may request a wake; callbacks only ever run on the thread
/// inside [`Loop::run`].
pub struct Loop {
    me: Weak<Loop>,
    config: LoopConfig,
    poller: Poller,
    events: Mutex<Events>,
    /// Registered wake handles, keyed by slab index.
    handles: Mutex<Slab<Entry>>,
    /// Pending wake requests. At most one per handle thanks to `RawAsync::pending`.
    wakes: ConcurrentQueue<WakeToken>,
    /// Close callbacks deferred to the next iteration.
    closing: Mutex<Vec<(HandlePtr, CloseCb)>>,
    /// Ready queue of the loop-local executor.
    pub(crate) tasks: ConcurrentQueue<Runnable>,
    /// Spawned tasks that have not finished yet.
    pub(crate) live_tasks: Arc<AtomicUsize>,
    /// Thread currently inside `run`, if any.
    owner: Mutex<Option<ThreadId>>,
    stop_requested: AtomicBool,
    next_id: AtomicU64,
}

impl Loop {
    pub fn new() -> io::Result<Arc<Loop>> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> io::Result<Arc<Loop>> {
        let poller = Poller::new()?;
        Ok(Arc::new_cyclic(|me| Loop {
            me: me.clone(),
            config,
            poller,
            events: Mutex::new(Events::new()),
            handles: Mutex::new(Slab::new()),
            wakes: ConcurrentQueue::unbounded(),
            closing: Mutex::new(Vec::new()),
            tasks: ConcurrentQueue::unbounded(),
            live_tasks: Arc::new(AtomicUsize::new(0)),
            owner: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn builder() -> LoopBuilder {
        LoopBuilder::new()
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub(crate) fn weak(&self) -> Weak<Loop> {
        self.me.clone()
    }

    // ── Thread affinity ────────────────────────────────────────────

    /// The thread currently running the loop, `None` while idle.
    pub fn loop_thread(&self) -> Option<ThreadId> {
        *self.owner.lock().unwrap()
    }

    /// True on the running thread, or on any thread while the loop is idle.
    pub fn is_loop_thread(&self) -> bool {
        match self.loop_thread() {
            Some(owner) => owner == thread::current().id(),
            None => true,
        }
    }

    pub fn is_running(&self) -> bool {
        self.loop_thread().is_some()
    }

    // ── Liveness ───────────────────────────────────────────────────

    /// Number of registered (armed, not closing) wake handles.
    pub fn active_handles(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Whether anything would keep [`RunMode::Default`] running.
    pub fn is_alive(&self) -> bool {
        self.active_handles() > 0
            || !self.closing.lock().unwrap().is_empty()
            || self.live_tasks.load(Ordering::Acquire) > 0
    }

    fn has_ready_work(&self) -> bool {
        !self.tasks.is_empty() || !self.wakes.is_empty() || !self.closing.lock().unwrap().is_empty()
    }

    // ── Running ────────────────────────────────────────────────────

    /// Drive the loop. Returns whether it is still alive afterwards.
    ///
    /// Fails with `EBUSY` if the loop is already running, including a
    /// re-entrant call from one of its own callbacks.
    pub fn run(&self, mode: RunMode) -> io::Result<bool> {
        let _running = self.enter()?;
        debug!(name = %self.config.name, ?mode, "loop running");

        loop {
            let worked = self.tick();

            if self.stop_requested.swap(false, Ordering::AcqRel) {
                break;
            }
            if mode == RunMode::NoWait || (mode == RunMode::Once && worked) || !self.is_alive() {
                break;
            }

            // Block until a wake request, unless work is already queued.
            let timeout = if self.has_ready_work() {
                Some(Duration::ZERO)
            } else {
                None
            };
            self.poll(timeout)?;
        }

        let alive = self.is_alive();
        debug!(name = %self.config.name, alive, "loop returned");
        Ok(alive)
    }

    /// Ask the loop to return from [`Loop::run`] after its current pass.
    /// Safe from any thread. A stop requested while idle applies to the next run.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.notify();
    }

    fn enter(&self) -> io::Result<Running<'_>> {
        let mut owner = self.owner.lock().unwrap();
        if owner.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        *owner = Some(thread::current().id());
        Ok(Running { lp: self })
    }

    /// One pass: close callbacks, spawned tasks, then wake callbacks.
    fn tick(&self) -> bool {
        let closed = self.run_closing();
        let polled = self.run_tasks();
        let woken = self.run_wakes();
        closed || polled || woken
    }

    fn poll(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut events = self.events.lock().unwrap();
        events.clear();
        match self.poller.wait(&mut events, timeout) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn notify(&self) {
        if let Err(e) = self.poller.notify() {
            warn!(name = %self.config.name, error = %e, "failed to notify poller");
        }
    }

    fn run_closing(&self) -> bool {
        let closing = mem::take(&mut *self.closing.lock().unwrap());
        let any = !closing.is_empty();
        for (handle, cb) in closing {
            // The callback may free the handle; don't touch it afterwards.
            unsafe { (*handle.0).flags.store(FLAG_CLOSED, Ordering::Release) };
            cb(handle.0);
        }
        any
    }

    fn run_wakes(&self) -> bool {
        let mut any = false;
        // Only the tokens queued before this pass: a callback that sends to
        // its own handle is picked up next pass, not in a busy loop here.
        for _ in 0..self.wakes.len() {
            let Ok(token) = self.wakes.pop() else {
                break;
            };

            let target = {
                let handles = self.handles.lock().unwrap();
                handles
                    .get(token.first)
                    .filter(|entry| entry.id == token.second)
                    .map(|entry| (entry.handle, entry.cb))
            };
            let Some((handle, cb)) = target else {
                trace!(key = token.first, id = token.second, "dropping stale wake");
                continue;
            };

            // Cleared before the callback: a send made while it runs gets
            // its own wake.
            unsafe { (*handle.0).pending.store(false, Ordering::Release) };
            trace!(id = token.second, "dispatching wake");
            cb(handle.0);
            any = true;
        }
        any
    }

    // ── Raw handle operations (see `ffi`) ──────────────────────────

    /// Register `handle` with this loop, or replace its callback if it is
    /// already registered here.
    ///
    /// # Safety
    /// `handle` must be valid and stay at the same address until closed.
    pub(crate) unsafe fn async_init(&self, handle: *mut RawAsync, cb: AsyncCb) -> c_int {
        let flags = (*handle).flags.load(Ordering::Acquire);
        if flags & (FLAG_CLOSING | FLAG_CLOSED) != 0 {
            return status::EINVAL;
        }

        let mut handles = self.handles.lock().unwrap();
        if flags & FLAG_ACTIVE != 0 {
            if !ptr::eq((*handle).lp, self) {
                return status::EINVAL;
            }
            return match handles.get_mut((*handle).key) {
                Some(entry) if entry.id == (*handle).id => {
                    entry.cb = cb;
                    status::OK
                }
                _ => status::EINVAL,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = handles.vacant_entry();
        let key = slot.key();
        slot.insert(Entry {
            handle: HandlePtr(handle),
            id,
            cb,
        });

        (*handle).lp = self;
        (*handle).key = key;
        (*handle).id = id;
        (*handle).pending.store(false, Ordering::Relaxed);
        (*handle).flags.store(FLAG_ACTIVE, Ordering::Release);
        trace!(name = %self.config.name, key, id, "async handle registered");
        status::OK
    }

    /// Request a wake for `handle`. Coalesces with an already pending request.
    pub(crate) fn async_send(&self, handle: &RawAsync) -> c_int {
        if handle.flags.load(Ordering::Acquire) != FLAG_ACTIVE {
            return status::EBADF;
        }
        if handle.pending.swap(true, Ordering::AcqRel) {
            return status::OK;
        }

        let token = WakeToken {
            first: handle.key,
            second: handle.id,
        };
        if self.wakes.push(token).is_err() {
            handle.pending.store(false, Ordering::Release);
            return status::EIO;
        }
        match self.poller.notify() {
            Ok(()) => status::OK,
            Err(e) => status::from_io(&e),
        }
    }

    /// Detach `handle`. Without a callback the handle is closed on return;
    /// with one, the callback runs on the next loop iteration.
    ///
    /// # Safety
    /// `handle` must be valid. With a callback it must stay valid until the
    /// callback runs.
    pub(crate) unsafe fn close(&self, handle: *mut RawAsync, cb: Option<CloseCb>) -> c_int {
        // Held to the end: no thread can start running the loop, and so
        // dispatch to this handle, until it is out of the registry.
        let owner = self.owner.lock().unwrap();
        if owner.is_some_and(|id| id != thread::current().id()) {
            return status::EPERM;
        }

        let raw = &*handle;
        let flags = raw.flags.load(Ordering::Acquire);
        if flags & (FLAG_CLOSING | FLAG_CLOSED) != 0 {
            return status::EINVAL;
        }
        raw.flags.store(FLAG_CLOSING, Ordering::Release);

        if flags & FLAG_ACTIVE != 0 {
            let mut handles = self.handles.lock().unwrap();
            if handles.get(raw.key).is_some_and(|entry| entry.id == raw.id) {
                handles.remove(raw.key);
            }
        }
        raw.pending.store(false, Ordering::Release);

        match cb {
            Some(cb) => {
                self.closing.lock().unwrap().push((HandlePtr(handle), cb));
                self.notify();
            }
            None => raw.flags.store(FLAG_CLOSED, Ordering::Release),
        }
        trace!(name = %self.config.name, id = raw.id, deferred = cb.is_some(), "async handle closing");
        drop(owner);
        status::OK
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        let handles = self.handles.get_mut().map(|h| h.len()).unwrap_or(0);
        let closing = self.closing.get_mut().map(|c| c.len()).unwrap_or(0);
        if handles > 0 || closing > 0 {
            warn!(name = %self.config.name, handles, closing, "loop dropped with live handles");
        }
    }
}

/// Marks the loop as running on the current thread for the guard's lifetime.
struct Running<'a> {
    lp: &'a Loop,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        *self.lp.owner.lock().unwrap() = None;
    }
}
