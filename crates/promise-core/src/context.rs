//! Execution contexts (C3) — where a settled promise's observers run.
//!
//! A [`Context`] is a closed set of dispatch targets with different payloads
//! (a priority class, a caller-supplied queue, a recursive wrapper for
//! [`Context::NowOr`]). Every variant is driven through the single entry
//! point [`Context::execute`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread;

/// A unit of work dispatched onto a context. Takes the resolved
/// "is this running synchronously" flag so it can forward it to whatever it
/// ultimately calls (typically the user's observer closure).
pub type Job = Box<dyn FnOnce(bool) + Send + 'static>;

/// Process-wide priority classes for [`Context::Priority`], mirroring the
/// five QoS classes of the original implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Background,
    Utility,
    Default,
    UserInitiated,
    UserInteractive,
}

const PRIORITIES: [Priority; 5] = [
    Priority::Background,
    Priority::Utility,
    Priority::Default,
    Priority::UserInitiated,
    Priority::UserInteractive,
];

/// A caller-supplied serial or concurrent queue.
///
/// Implementors decide their own ordering and concurrency guarantees; the
/// core only requires that `enqueue`'d jobs eventually run.
pub trait Queue: Send + Sync {
    fn enqueue(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// A caller-supplied task-queue abstraction: a discrete work item that may
/// stay pending until the queue's own dependency tracking clears it.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Where a dispatched observer closure actually runs.
#[derive(Clone)]
pub enum Context {
    /// The coalescing main context; see [`main_loop`].
    Main,
    /// A process-wide pool, one lane per [`Priority`].
    Priority(Priority),
    /// A caller-supplied serial or concurrent queue.
    Queue(Arc<dyn Queue>),
    /// A caller-supplied task-queue abstraction.
    TaskQueue(Arc<dyn TaskQueue>),
    /// Run synchronously on the caller's thread, no hop.
    Immediate,
    /// Run immediately if the dispatch is already synchronous (the cell was
    /// terminal at registration time); otherwise dispatch on `inner`.
    NowOr(Box<Context>),
}

impl Context {
    /// `Main` on the thread marked main (see
    /// [`main_loop::mark_current_thread_as_main`]), `Priority(Default)`
    /// elsewhere.
    pub fn auto() -> Context {
        if main_loop::is_main_thread() {
            Context::Main
        } else {
            Context::Priority(Priority::Default)
        }
    }

    pub fn queue(q: Arc<dyn Queue>) -> Context {
        Context::Queue(q)
    }

    pub fn task_queue(q: Arc<dyn TaskQueue>) -> Context {
        Context::TaskQueue(q)
    }

    pub fn immediate() -> Context {
        Context::Immediate
    }

    pub fn now_or(inner: Context) -> Context {
        Context::NowOr(Box::new(inner))
    }

    /// Dispatch `job` through this context.
    ///
    /// `is_synchronous_hint` communicates whether the *caller* is already in
    /// a synchronous callback invocation (true only when the cell was
    /// already terminal at registration time, or when propagated in from an
    /// outer synchronous caller). Contexts that hop threads always deliver
    /// `false` to `job`; [`Context::Immediate`] inherits the hint verbatim;
    /// [`Context::NowOr`] decides per branch.
    pub fn execute(&self, is_synchronous_hint: bool, job: Job) {
        match self {
            Context::Main => {
                log::trace!("dispatch: Main (hint={is_synchronous_hint})");
                main_loop::dispatch(Box::new(move || run(job, false)));
            }
            Context::Priority(p) => {
                log::trace!("dispatch: Priority({p:?}) (hint={is_synchronous_hint})");
                priority_pool::dispatch(*p, Box::new(move || run(job, false)));
            }
            Context::Queue(q) => {
                log::trace!("dispatch: Queue (hint={is_synchronous_hint})");
                q.enqueue(Box::new(move || run(job, false)));
            }
            Context::TaskQueue(q) => {
                log::trace!("dispatch: TaskQueue (hint={is_synchronous_hint})");
                q.enqueue(Box::new(move || run(job, false)));
            }
            Context::Immediate => {
                log::trace!("dispatch: Immediate (hint={is_synchronous_hint})");
                with_now_or_flag(is_synchronous_hint, || run(job, is_synchronous_hint));
            }
            Context::NowOr(inner) => {
                if is_synchronous_hint {
                    log::trace!("dispatch: NowOr taking now-branch");
                    with_now_or_flag(true, || run(job, true));
                } else {
                    log::trace!("dispatch: NowOr taking async-branch");
                    with_now_or_flag(false, || inner.execute(false, job));
                }
            }
        }
    }

    /// `true` if this is the distinguished [`Context::Main`] variant (used by
    /// combinators to decide whether main-coalescing applies; per spec.md
    /// §4.3 this coalescing never applies to `Queue(main_queue)`, only to
    /// the distinguished variant).
    pub fn is_main(&self) -> bool {
        matches!(self, Context::Main)
    }
}

fn run(job: Job, is_synchronous: bool) {
    // The core treats observer closures as non-failing (spec §4.2); a panic
    // inside user code must not poison shared pool/queue threads, so it is
    // caught and logged rather than propagated.
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(is_synchronous))) {
        log::error!("observer closure panicked: {:?}", panic_message(&payload));
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

// ---------------------------------------------------------------------------
// Now-or-else flag (spec §4.3)
// ---------------------------------------------------------------------------

thread_local! {
    static NOW_OR_ELSE: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

fn with_now_or_flag<R>(value: bool, f: impl FnOnce() -> R) -> R {
    let previous = NOW_OR_ELSE.with(|c| c.replace(value));
    let result = f();
    NOW_OR_ELSE.with(|c| c.set(previous));
    result
}

/// `true` if the calling thread is currently executing inside a synchronous
/// [`Context::NowOr`] now-branch, or a [`Context::Immediate`] dispatch that
/// inherited a true hint.
pub fn is_executing_now() -> bool {
    NOW_OR_ELSE.with(|c| c.get())
}

// ---------------------------------------------------------------------------
// Priority pool
// ---------------------------------------------------------------------------

mod priority_pool {
    use super::*;

    type PoolJob = Box<dyn FnOnce() + Send + 'static>;

    struct Pool {
        senders: [mpsc::Sender<PoolJob>; 5],
    }

    static POOL: OnceLock<Pool> = OnceLock::new();

    fn pool() -> &'static Pool {
        POOL.get_or_init(|| {
            let mut senders = Vec::with_capacity(5);
            for priority in PRIORITIES {
                let (tx, rx) = mpsc::channel::<PoolJob>();
                thread::Builder::new()
                    .name(format!("promise-core-{priority:?}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn promise-core priority worker");
                senders.push(tx);
            }
            Pool {
                senders: senders.try_into().unwrap_or_else(|_| unreachable!()),
            }
        })
    }

    pub fn dispatch(priority: Priority, job: PoolJob) {
        let idx = PRIORITIES.iter().position(|p| *p == priority).unwrap();
        pool().senders[idx]
            .send(job)
            .expect("priority worker thread terminated unexpectedly");
    }
}

// ---------------------------------------------------------------------------
// Main coalescing (spec §4.3)
// ---------------------------------------------------------------------------

/// The coalescing main-thread dispatcher.
///
/// The core owns no threads (Non-goal: not a scheduler), so there is no real
/// run loop here — callers mark their own run-loop thread with
/// [`mark_current_thread_as_main`] and periodically call [`pump`] to drain
/// dispatches that arrived from other threads. Jobs dispatched *from* the
/// main thread run inline immediately, coalescing any further `Main`
/// registrations made while that job runs into a single pass.
pub mod main_loop {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Mutex, OnceLock};

    type MainJob = Box<dyn FnOnce() + Send + 'static>;

    thread_local! {
        static IS_MAIN: Cell<bool> = Cell::new(false);
        static IN_BLOCK: Cell<bool> = Cell::new(false);
        static FIFO: RefCell<VecDeque<MainJob>> = RefCell::new(VecDeque::new());
    }

    struct CrossThreadQueue {
        tx: Sender<MainJob>,
        rx: Mutex<Receiver<MainJob>>,
    }

    static QUEUE: OnceLock<CrossThreadQueue> = OnceLock::new();

    fn queue() -> &'static CrossThreadQueue {
        QUEUE.get_or_init(|| {
            let (tx, rx) = mpsc::channel();
            CrossThreadQueue {
                tx,
                rx: Mutex::new(rx),
            }
        })
    }

    /// Mark the calling OS thread as "the main thread" for the purposes of
    /// [`Context::auto`](super::Context::auto) and [`is_main_thread`].
    pub fn mark_current_thread_as_main() {
        IS_MAIN.with(|c| c.set(true));
    }

    /// `true` if [`mark_current_thread_as_main`] was called on this thread.
    pub fn is_main_thread() -> bool {
        IS_MAIN.with(|c| c.get())
    }

    pub(crate) fn dispatch(job: MainJob) {
        if is_main_thread() {
            run_coalesced(job);
        } else {
            queue()
                .tx
                .send(job)
                .expect("main-context dispatch queue is gone");
        }
    }

    fn run_coalesced(job: MainJob) {
        if IN_BLOCK.with(|c| c.get()) {
            // Already inside a Main dispatch on this thread: append instead
            // of hopping, so the whole chain resolves within one pass.
            FIFO.with(|f| f.borrow_mut().push_back(job));
            return;
        }
        IN_BLOCK.with(|c| c.set(true));
        job();
        loop {
            let next = FIFO.with(|f| f.borrow_mut().pop_front());
            match next {
                Some(job) => job(),
                None => break,
            }
        }
        IN_BLOCK.with(|c| c.set(false));
    }

    /// Drain any `Main` dispatches that arrived from other threads.
    ///
    /// Must be called from the thread marked main (typically once per
    /// real run-loop turn). Each drained job runs coalesced with any
    /// further `Main` registrations it makes, per spec.md P6.
    pub fn pump() {
        debug_assert!(
            is_main_thread(),
            "main_loop::pump() must run on the thread marked main"
        );
        loop {
            let job = queue().rx.lock().unwrap().try_recv();
            match job {
                Ok(job) => run_coalesced(job),
                Err(_) => break,
            }
        }
    }

    /// Test-facing name for [`pump`]: drain every pending `Main` dispatch
    /// without a real run loop driving it, so C8 callers can assert P6
    /// (main-thread coalescing) deterministically.
    pub fn drain_for_test() {
        pump();
    }
}

// ---------------------------------------------------------------------------
// Reference Queue/TaskQueue adapters
// ---------------------------------------------------------------------------

/// Reference implementations of [`Queue`]/[`TaskQueue`] for runtimes already
/// in common use alongside this crate, so callers don't all have to write
/// the same `Arc<dyn Queue>` shim.
pub mod adapters {
    use super::{Queue, TaskQueue};
    use tokio::runtime::Handle;

    /// Dispatches onto a [`tokio::runtime::Handle`].
    ///
    /// Jobs run via `spawn_blocking`, since `Queue`/`TaskQueue` jobs are
    /// plain synchronous closures that may themselves block. Panics inside
    /// a job are caught upstream by the dispatching `Context::execute`
    /// before they ever reach this queue, so a panicking observer never
    /// shows up as a failed `JoinHandle` here.
    pub struct TokioQueue {
        handle: Handle,
    }

    impl TokioQueue {
        pub fn new(handle: Handle) -> Self {
            TokioQueue { handle }
        }

        /// Bind to the runtime of the thread calling this constructor.
        /// Panics outside a tokio runtime context, same as
        /// [`Handle::current`].
        pub fn current() -> Self {
            TokioQueue::new(Handle::current())
        }
    }

    impl Queue for TokioQueue {
        fn enqueue(&self, job: Box<dyn FnOnce() + Send + 'static>) {
            self.handle.spawn_blocking(job);
        }
    }

    impl TaskQueue for TokioQueue {
        fn enqueue(&self, job: Box<dyn FnOnce() + Send + 'static>) {
            self.handle.spawn_blocking(job);
        }
    }
}
