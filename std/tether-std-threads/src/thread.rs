//!
//! Thread Control Records
//!
//! Every native thread that runs managed code is represented by exactly one
//! `Thread` record. The record is created before its native thread exists,
//! holding the entry point and arguments, and moves one way through
//!
//! ```text
//!   Created { payload } ──start──> Running ──mark_dead──> Dead { free_next }
//! ```
//!
//! Foreign threads (entering from outside the runtime) and signal-handling
//! threads are records too. Foreign records skip `Created`.
//!
//! ## Identity
//!
//! `native_handle` is the `pthread_t` of the native thread and is 0 before
//! start and after death. `os_id` is the kernel thread id; it is recorded at
//! start and kept after death for diagnostics. Both are plain words so they
//! can be read while the native thread is exiting. `stack_bound` is only
//! meaningful to the thread itself.
//!
//! ## Interruptions
//!
//! Other threads post callables to a record. The owning thread runs them in
//! FIFO order at safepoints and whenever it is woken out of a waitqueue. A
//! callable returning `ControlFlow::Break` unwinds the current wait.
//!

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

pub use tether_std_core::Value;
use tether_std_core::{set_status, STATUS_OK};

use crate::error::{fatal, SyncError};
use crate::mutex::Locked;
use crate::registry;
use crate::semaphore::Semaphore;
use crate::sys;
use crate::waitqueue::WaitQueue;

/// Capacity of the startup argument vector
pub const STARTUP_ARG_SLOTS: usize = 8;

pub type ThreadEntry =
    Box<dyn FnOnce(&[Value]) -> Result<Vec<Value>, SyncError> + Send + 'static>;

pub type Interruption = Box<dyn FnOnce() -> ControlFlow<()> + Send + 'static>;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
    static CURRENT_ID: Cell<u64> = const { Cell::new(0) };
}

/// Identifies a thread record, or a native thread without one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    fn next() -> Self {
        ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        ThreadId(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of the calling thread: its record's id when attached, otherwise an
/// id assigned on first use.
pub fn current_id() -> ThreadId {
    CURRENT_ID.with(|id| {
        if id.get() == 0 {
            id.set(ThreadId::next().0);
        }
        ThreadId(id.get())
    })
}

/// Record of the calling thread, if it has one
pub fn current() -> Option<Arc<Thread>> {
    CURRENT.try_with(|current| current.borrow().clone()).ok().flatten()
}

pub(crate) fn set_current(record: Option<Arc<Thread>>) {
    let raw = record.as_ref().map_or(0, |record| record.id.0);
    CURRENT_ID.with(|id| id.set(raw));
    CURRENT.with(|current| *current.borrow_mut() = record);
}

/// Safepoint check for the calling thread. Returns how many interruptions ran.
pub fn safepoint() -> Result<usize, SyncError> {
    match current() {
        Some(record) if record.has_pending_interruptions() => record.run_pending_interruptions(),
        _ => Ok(0),
    }
}

/// Entry point and arguments of a thread that has not started yet
pub struct StartupPayload {
    entry: ThreadEntry,
    args: [Value; STARTUP_ARG_SLOTS],
    argc: usize,
}

impl StartupPayload {
    pub fn new<F>(args: &[Value], entry: F) -> Result<Self, SyncError>
    where
        F: FnOnce(&[Value]) -> Result<Vec<Value>, SyncError> + Send + 'static,
    {
        if args.len() > STARTUP_ARG_SLOTS {
            return Err(SyncError::TooManyArguments {
                count: args.len(),
                limit: STARTUP_ARG_SLOTS,
            });
        }
        let mut slots = [0; STARTUP_ARG_SLOTS];
        slots[..args.len()].copy_from_slice(args);
        Ok(Self {
            entry: Box::new(entry),
            args: slots,
            argc: args.len(),
        })
    }

    pub fn args(&self) -> &[Value] {
        &self.args[..self.argc]
    }

    pub fn run(self) -> Result<Vec<Value>, SyncError> {
        let StartupPayload { entry, args, argc } = self;
        entry(&args[..argc])
    }
}

impl std::fmt::Debug for StartupPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupPayload")
            .field("args", &self.args())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Managed,
    Foreign,
    SignalHandler { signal: i32 },
}

/// Native memory handed to a runtime-created thread. Recycled from dead
/// records through the registry free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBlock {
    pub index: u64,
    pub stack_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Created,
    Running,
    Dead,
}

pub(crate) enum Lifecycle {
    Created { payload: StartupPayload },
    Running,
    Dead { free_next: Option<Arc<Thread>> },
}

/// What a blocked thread is waiting on. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedOn {
    pub address: usize,
    pub name: Option<&'static str>,
}

impl BlockedOn {
    pub fn waitqueue<Q: WaitQueue>(queue: &Q) -> Self {
        Self {
            address: queue as *const Q as usize,
            name: queue.name(),
        }
    }
}

/// Wakes a thread blocked in a waitqueue so it can look at its interruptions
pub(crate) trait WakeHook: Sync {
    fn wake(&self);
}

#[derive(Clone, Copy)]
struct HookRef(*const (dyn WakeHook + 'static));

// SAFETY: the hook is registered and removed by the waiting thread under the
// interruptions lock, and only dereferenced under that lock.
unsafe impl Send for HookRef {}

struct InterruptState {
    dead: bool,
    queue: VecDeque<Interruption>,
    hook: Option<HookRef>,
    blocked_on: Option<BlockedOn>,
}

pub struct Thread {
    id: ThreadId,
    name: String,
    ephemeral: bool,
    visible: bool,
    kind: ThreadKind,
    block: Option<NativeBlock>,
    native_handle: AtomicUsize,
    os_id: AtomicU64,
    stack_bound: AtomicUsize,
    starting: AtomicBool,
    lifecycle: Locked<Lifecycle>,
    interrupts: Locked<InterruptState>,
    pending: AtomicBool,
    result: OnceLock<Vec<Value>>,
    join: Option<Arc<Semaphore>>,
}

impl Thread {
    fn build(
        name: String,
        ephemeral: bool,
        kind: ThreadKind,
        block: Option<NativeBlock>,
        joinable: bool,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            id: ThreadId::next(),
            name,
            ephemeral,
            visible: !ephemeral,
            kind,
            block,
            native_handle: AtomicUsize::new(0),
            os_id: AtomicU64::new(0),
            stack_bound: AtomicUsize::new(0),
            starting: AtomicBool::new(false),
            lifecycle: Locked::new("thread lifecycle lock", lifecycle),
            interrupts: Locked::new("thread interruptions lock", InterruptState {
                dead: false,
                queue: VecDeque::new(),
                hook: None,
                blocked_on: None,
            }),
            pending: AtomicBool::new(false),
            result: OnceLock::new(),
            join: joinable.then(|| Arc::new(Semaphore::new("thread join semaphore", 0))),
        }
    }

    pub(crate) fn new_created(
        name: String,
        ephemeral: bool,
        kind: ThreadKind,
        block: NativeBlock,
        joinable: bool,
        payload: StartupPayload,
    ) -> Self {
        Self::build(name, ephemeral, kind, Some(block), joinable, Lifecycle::Created { payload })
    }

    /// Record for the calling native thread, already running
    pub(crate) fn new_attached(name: String, kind: ThreadKind) -> Self {
        let record = Self::build(name, true, kind, None, false, Lifecycle::Running);
        record.os_id.store(sys::current_os_id(), Ordering::Relaxed);
        record.native_handle.store(sys::native_handle(), Ordering::Release);
        record.starting.store(true, Ordering::Relaxed);
        record
    }

    /// Create a joinable record. The native thread starts with `start`.
    pub fn create(
        name: impl Into<String>,
        ephemeral: bool,
        payload: StartupPayload,
    ) -> Result<Arc<Thread>, SyncError> {
        registry::create_thread(name.into(), ephemeral, ThreadKind::Managed, true, payload)
    }

    /// Create a record without a join semaphore
    pub fn create_detached(
        name: impl Into<String>,
        ephemeral: bool,
        payload: StartupPayload,
    ) -> Result<Arc<Thread>, SyncError> {
        registry::create_thread(name.into(), ephemeral, ThreadKind::Managed, false, payload)
    }

    /// Create and start a joinable, visible thread
    pub fn spawn(name: impl Into<String>, payload: StartupPayload) -> Result<Arc<Thread>, SyncError> {
        let record = Self::create(name, false, payload)?;
        record.start()?;
        Ok(record)
    }

    /// Create the native thread. On failure the record stays `Created`.
    pub fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyStarted {
                name: self.name.clone(),
            });
        }

        let stack_size = self
            .block
            .map_or(tether_std_core::DEFAULT_STACK_SIZE, |block| block.stack_size);
        let record = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .stack_size(stack_size)
            .spawn(move || trampoline(record));

        match spawned {
            Ok(_detached) => Ok(()),
            Err(source) => {
                self.starting.store(false, Ordering::Release);
                Err(SyncError::ThreadCreate {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// `Created -> Running`. Returns the startup payload for the new thread.
    pub fn mark_started(&self, native_handle: usize, os_id: u64) -> Result<StartupPayload, SyncError> {
        let mut lifecycle = self.lifecycle.lock();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Running) {
            Lifecycle::Created { payload } => {
                self.starting.store(true, Ordering::Relaxed);
                self.os_id.store(os_id, Ordering::Relaxed);
                self.native_handle.store(native_handle, Ordering::Release);
                tracing::debug!(thread = %self.name, id = %self.id, os_id, "thread started");
                Ok(payload)
            }
            other => {
                *lifecycle = other;
                Err(SyncError::AlreadyStarted {
                    name: self.name.clone(),
                })
            }
        }
    }

    /// Record the completion values of a normally returning thread.
    pub fn set_result(&self, values: Vec<Value>) -> Result<(), SyncError> {
        if self.status() != ThreadStatus::Running {
            return Err(SyncError::NotRunning {
                name: self.name.clone(),
            });
        }
        self.result.set(values).map_err(|_| SyncError::ResultAlreadySet {
            name: self.name.clone(),
        })
    }

    /// `Running -> Dead`. The record leaves the registry before joiners are
    /// released; its native block is recycled once the handle is cleared.
    pub fn mark_dead(self: &Arc<Self>) -> Result<(), SyncError> {
        let (registered, dropped) = registry::unregister(self, || self.enter_dead())?;
        drop(dropped);

        if let Some(join) = &self.join {
            join.signal(1);
        }
        self.native_handle.store(0, Ordering::Release);
        if registered {
            registry::recycle(self);
        }
        tracing::debug!(thread = %self.name, id = %self.id, "thread dead");
        Ok(())
    }

    /// Runs under the registry lock. Returns the interruptions that were
    /// still queued so they are dropped outside every lock.
    fn enter_dead(&self) -> Result<VecDeque<Interruption>, SyncError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, Lifecycle::Running) {
                return Err(SyncError::NotRunning {
                    name: self.name.clone(),
                });
            }
            *lifecycle = Lifecycle::Dead { free_next: None };
        }

        let mut interrupts = self.interrupts.lock();
        interrupts.dead = true;
        interrupts.hook = None;
        interrupts.blocked_on = None;
        self.pending.store(false, Ordering::Release);
        Ok(std::mem::take(&mut interrupts.queue))
    }

    /// Wait for the thread to finish and return its result. Every joiner
    /// gets the result; joining a record that is never started blocks.
    pub fn join(&self) -> Result<Vec<Value>, SyncError> {
        let join = self.join.as_ref().ok_or_else(|| SyncError::NotJoinable {
            name: self.name.clone(),
        })?;
        if self.id == current_id() {
            return Err(SyncError::JoinSelf {
                name: self.name.clone(),
            });
        }

        join.wait_for_count(1)?;
        join.signal(1);

        self.result.get().cloned().ok_or_else(|| SyncError::NoResult {
            name: self.name.clone(),
        })
    }

    /// Queue `callable` to run on this thread at its next check point.
    pub fn post_interruption<F>(&self, callable: F) -> Result<(), SyncError>
    where
        F: FnOnce() -> ControlFlow<()> + Send + 'static,
    {
        let mut interrupts = self.interrupts.lock();
        if interrupts.dead {
            return Err(SyncError::NotRunning {
                name: self.name.clone(),
            });
        }
        interrupts.queue.push_back(Box::new(callable));
        self.pending.store(true, Ordering::Release);
        if let Some(hook) = interrupts.hook {
            // SAFETY: a registered hook stays valid until the waiter removes
            // it, which needs the lock held here.
            unsafe { (*hook.0).wake() };
        }
        tracing::trace!(thread = %self.name, queued = interrupts.queue.len(), "interruption posted");
        Ok(())
    }

    /// Run queued interruptions in order. Only the owning thread may call
    /// this. Stops at the first callable that breaks.
    pub fn run_pending_interruptions(&self) -> Result<usize, SyncError> {
        if self.id != current_id() {
            return Err(SyncError::NotCurrentThread {
                name: self.name.clone(),
            });
        }

        let mut ran = 0;
        loop {
            let next = {
                let mut interrupts = self.interrupts.lock();
                let next = interrupts.queue.pop_front();
                if interrupts.queue.is_empty() {
                    self.pending.store(false, Ordering::Release);
                }
                next
            };
            let Some(callable) = next else {
                return Ok(ran);
            };
            ran += 1;
            if callable().is_break() {
                return Err(SyncError::Interrupted);
            }
        }
    }

    pub fn has_pending_interruptions(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn pending_interruptions(&self) -> usize {
        self.interrupts.lock().queue.len()
    }

    /// Register the wake hook of a wait about to block. False when an
    /// interruption is already pending and the caller must not block.
    pub(crate) fn register_wait(&self, hook: &(dyn WakeHook + 'static), blocked: BlockedOn) -> bool {
        let mut interrupts = self.interrupts.lock();
        if self.pending.load(Ordering::Acquire) {
            return false;
        }
        interrupts.hook = Some(HookRef(hook as *const (dyn WakeHook + 'static)));
        interrupts.blocked_on = Some(blocked);
        true
    }

    pub(crate) fn unregister_wait(&self) {
        let mut interrupts = self.interrupts.lock();
        interrupts.hook = None;
        interrupts.blocked_on = None;
    }

    pub fn blocked_on(&self) -> Option<BlockedOn> {
        self.interrupts.lock().blocked_on
    }

    /// Lowest usable stack address of the calling thread's own record.
    /// 0 when unknown (foreign threads).
    pub fn stack_bound(&self) -> Result<usize, SyncError> {
        if self.id != current_id() {
            return Err(SyncError::NotCurrentThread {
                name: self.name.clone(),
            });
        }
        Ok(self.stack_bound.load(Ordering::Relaxed))
    }

    pub fn status(&self) -> ThreadStatus {
        match &*self.lifecycle.lock() {
            Lifecycle::Created { .. } => ThreadStatus::Created,
            Lifecycle::Running => ThreadStatus::Running,
            Lifecycle::Dead { .. } => ThreadStatus::Dead,
        }
    }

    /// Free-list successor of a dead record. None when the record is not
    /// dead, which means the free list is corrupt.
    pub(crate) fn take_free_next(&self) -> Option<Option<Arc<Thread>>> {
        match &mut *self.lifecycle.lock() {
            Lifecycle::Dead { free_next } => Some(free_next.take()),
            _ => None,
        }
    }

    pub(crate) fn set_free_next(&self, next: Option<Arc<Thread>>) -> bool {
        match &mut *self.lifecycle.lock() {
            Lifecycle::Dead { free_next } => {
                *free_next = next;
                true
            }
            _ => false,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_joinable(&self) -> bool {
        self.join.is_some()
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Signal routed to this thread, for signal-handling threads
    pub fn signal(&self) -> Option<i32> {
        match self.kind {
            ThreadKind::SignalHandler { signal } => Some(signal),
            _ => None,
        }
    }

    pub fn block(&self) -> Option<NativeBlock> {
        self.block
    }

    /// `pthread_t` of the native thread; 0 before start and after death
    pub fn native_handle(&self) -> usize {
        self.native_handle.load(Ordering::Acquire)
    }

    pub fn os_id(&self) -> u64 {
        self.os_id.load(Ordering::Relaxed)
    }

    pub fn result(&self) -> Option<Vec<Value>> {
        self.result.get().cloned()
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("ephemeral", &self.ephemeral)
            .field("native_handle", &self.native_handle())
            .field("os_id", &self.os_id())
            .finish_non_exhaustive()
    }
}

fn trampoline(record: Arc<Thread>) {
    let payload = match record.mark_started(sys::native_handle(), sys::current_os_id()) {
        Ok(payload) => payload,
        Err(err) => fatal(format_args!("thread '{}' entered twice: {}", record.name, err)),
    };

    let marker = 0u8;
    let top = &marker as *const u8 as usize;
    let stack_size = record.block.map_or(0, |block| block.stack_size);
    record.stack_bound.store(top.saturating_sub(stack_size), Ordering::Relaxed);

    set_current(Some(Arc::clone(&record)));
    match catch_unwind(AssertUnwindSafe(|| payload.run())) {
        Ok(Ok(values)) => {
            if let Err(err) = record.set_result(values) {
                tracing::warn!(thread = %record.name, error = %err, "result dropped");
            }
        }
        Ok(Err(err)) => {
            tracing::debug!(thread = %record.name, error = %err, "thread unwound");
        }
        Err(_) => {
            tracing::warn!(thread = %record.name, "thread body panicked");
        }
    }
    set_current(None);

    if let Err(err) = record.mark_dead() {
        fatal(format_args!("thread '{}' could not finish: {}", record.name, err));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_thread_current_id() -> i64 {
    current_id().as_raw() as i64
}

/// Run pending interruptions of the calling thread. Returns how many ran,
/// or -1 when one of them requested an unwind.
#[unsafe(no_mangle)]
pub extern "C" fn tether_safepoint() -> i64 {
    match safepoint() {
        Ok(ran) => {
            set_status(STATUS_OK);
            ran as i64
        }
        Err(err) => {
            set_status(err.status_code());
            -1
        }
    }
}
