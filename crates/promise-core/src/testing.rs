//! Test fakes for execution contexts (C8).
//!
//! Concrete, predictable stand-ins for [`crate::context::Context`] targets,
//! so tests can control exactly when dispatched work runs instead of
//! racing real threads.
//!
//! # Design Decisions
//!
//! - **Concrete fakes, not mock frameworks** — a `ManualQueue` is a plain
//!   struct a test can read and drain by hand.
//! - **`Mutex<Vec<..>>`** for interior mutability — fakes are stored behind
//!   `Arc<dyn Queue>` / `Arc<dyn TaskQueue>` and must be `Send + Sync`.
//!
//! # Connections
//!
//! [`ManualQueue`] implements both [`crate::context::Queue`] and
//! [`crate::context::TaskQueue`]; wrap it in `Context::queue` /
//! `Context::task_queue` to get a context a test can drain deterministically.
//! [`RecordingContext`] instead runs jobs immediately and records the order
//! they ran in, for asserting ordering properties without manual stepping.
//! [`simulated_main_loop`] exercises [`crate::context::main_loop`] without a
//! real run loop thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::context::{main_loop, Context, Queue, TaskQueue};

type QueuedJob = Box<dyn FnOnce() + Send + 'static>;

/// A `Queue`/`TaskQueue` fake that stores dispatched jobs instead of
/// running them, so a test can assert "nothing ran yet" and then drain on
/// its own schedule.
#[derive(Default)]
pub struct ManualQueue {
    pending: Mutex<Vec<QueuedJob>>,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Number of jobs dispatched but not yet drained.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending job, in registration order.
    pub fn drain(&self) {
        while self.step() {}
    }

    /// Run exactly one pending job, in registration order, if any.
    /// Returns `false` if the queue was empty.
    pub fn step(&self) -> bool {
        let job = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            }
        };
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

impl Queue for ManualQueue {
    fn enqueue(&self, job: QueuedJob) {
        self.pending.lock().unwrap().push(job);
    }
}

impl TaskQueue for ManualQueue {
    fn enqueue(&self, job: QueuedJob) {
        self.pending.lock().unwrap().push(job);
    }
}

/// Drive [`main_loop`] deterministically from a test thread: marks the
/// calling thread as main, runs `body`, then pumps until no more
/// cross-thread `Main` dispatches remain.
pub fn simulated_main_loop<F: FnOnce()>(body: F) {
    main_loop::mark_current_thread_as_main();
    body();
    main_loop::pump();
}

/// A `Queue`/`TaskQueue` fake that runs every job immediately, in the
/// dispatching thread's call, while recording the order jobs actually ran
/// in. Unlike [`ManualQueue`] (which holds jobs back until a test drains
/// them), this is for asserting *ordering* properties — e.g. that a parent
/// promise's callbacks run before a child's (P2), or that cancellation
/// ordering holds across a combinator chain (P3) — without needing to
/// separately step a queue.
#[derive(Default)]
pub struct RecordingContext {
    next_id: AtomicU64,
    order: Mutex<Vec<u64>>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            order: Mutex::new(Vec::new()),
        }
    }

    /// The sequence numbers jobs ran under, in the order they ran. Each
    /// dispatch gets the next id at the moment it is enqueued, then runs
    /// synchronously, so this doubles as "which dispatch ran in which
    /// relative position" for tests that just need ordering, not identity.
    pub fn order(&self) -> Vec<u64> {
        self.order.lock().unwrap().clone()
    }

    fn run_and_record(&self, job: QueuedJob) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        job();
        self.order.lock().unwrap().push(id);
    }
}

impl Queue for RecordingContext {
    fn enqueue(&self, job: QueuedJob) {
        self.run_and_record(job);
    }
}

impl TaskQueue for RecordingContext {
    fn enqueue(&self, job: QueuedJob) {
        self.run_and_record(job);
    }
}

/// A stand-in [`Context`] backed by a fresh [`RecordingContext`], handed
/// back alongside it so a test can inspect dispatch order after the fact.
pub fn recording_context() -> (Context, std::sync::Arc<RecordingContext>) {
    let recorder = std::sync::Arc::new(RecordingContext::new());
    (Context::queue(recorder.clone()), recorder)
}

/// A stand-in [`Context`] that routes through a fresh [`ManualQueue`],
/// handed back alongside the context so a test can drain it explicitly.
pub fn manual_queue_context() -> (Context, std::sync::Arc<ManualQueue>) {
    let queue = std::sync::Arc::new(ManualQueue::new());
    (Context::queue(queue.clone()), queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Outcome;
    use crate::promise::promise_with_resolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn manual_queue_holds_jobs_until_drained() {
        let (ctx, queue) = manual_queue_context();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        ctx.execute(
            false,
            Box::new(move |_| {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);
        queue.drain();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn step_runs_jobs_in_order() {
        let (ctx, queue) = manual_queue_context();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            ctx.execute(false, Box::new(move |_| order.lock().unwrap().push(i)));
        }
        while queue.step() {}
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn recording_context_runs_inline_and_records_order() {
        let (ctx, recorder) = recording_context();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            ctx.execute(false, Box::new(move |_| order.lock().unwrap().push(i)));
        }
        // Each job ran synchronously inside `execute`, not deferred.
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(recorder.order(), vec![0, 1, 2]);
    }

    #[test]
    fn simulated_main_loop_drains_cross_thread_dispatch() {
        use crate::combinators::then;

        let (p, r) = promise_with_resolver::<i32, String>(None);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let child = then(&p, Context::Main, None, move |outcome| {
            if let Outcome::Value(v) = outcome {
                seen2.store(*v as usize, Ordering::SeqCst);
            }
        });

        // Resolve from a background thread: `Main` dispatch from a
        // non-main thread is queued, not run inline, so nothing has
        // happened yet by the time the thread joins.
        let handle = std::thread::spawn(move || r.resolve(9));
        handle.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        simulated_main_loop(|| {});
        assert_eq!(seen.load(Ordering::SeqCst), 9);
        assert_eq!(child.result_sync(), Some(Outcome::Value(9)));
    }
}
