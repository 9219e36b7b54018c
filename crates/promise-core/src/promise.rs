//! Promise and resolver handle types (C5).
//!
//! A [`Promise`] is a cloneable observer-side handle onto a [`Cell`]; a
//! [`Resolver`] is the producer-side handle. Both are thin `Arc<Cell<..>>`
//! wrappers — all of the interesting behavior lives in [`crate::cell`].

use std::sync::Arc;

use crate::cell::{Cell, Outcome};
use crate::context::Context;
use crate::token::Cancellable as TokenCancellable;

/// The observer-side handle onto a promise's cell.
///
/// Cloning a `Promise` registers a new live handle with the cell's observer
/// counter (spec.md §9, observer refcounting); dropping one releases it.
/// Once every clone is gone, the cell seals; if no cancel-propagating child
/// combinator is still registered against it either, nobody is left who
/// could ever produce a different outcome, and the cell cancels outright.
pub struct Promise<V, E> {
    cell: Arc<Cell<V, E>>,
}

impl<V, E> Clone for Promise<V, E> {
    fn clone(&self) -> Self {
        self.cell.register_handle();
        Promise {
            cell: self.cell.clone(),
        }
    }
}

impl<V, E> Drop for Promise<V, E> {
    fn drop(&mut self) {
        self.cell.release_handle();
    }
}

impl<V, E> TokenCancellable for Promise<V, E>
where
    V: Send + Sync,
    E: Send + Sync,
{
    fn request_cancel(&self) {
        self.cell.request_cancel();
    }
}

impl<V, E> Promise<V, E> {
    pub(crate) fn from_cell(cell: Arc<Cell<V, E>>) -> Self {
        cell.mark_alive();
        Promise { cell }
    }

    pub fn is_settled(&self) -> bool {
        self.cell.is_settled()
    }

    /// Request cancellation — advisory only (spec.md §5): fires any
    /// registered cancel-request closures, but does not by itself settle
    /// the promise. Whoever holds the [`Resolver`] decides whether, and
    /// when, to actually call [`Resolver::cancel`].
    pub fn cancel(&self) {
        self.cell.request_cancel();
    }

    /// Non-blocking peek at the outcome, if the cell has already settled.
    pub fn result_sync(&self) -> Option<Outcome<V, E>>
    where
        V: Clone,
        E: Clone,
    {
        self.cell.peek_sync()
    }

    /// Zero-clone synchronous peek: borrows the settled value/error instead
    /// of cloning it. The borrowing counterpart to `result_sync`, for
    /// callers who don't want to require `V: Clone, E: Clone` just to check
    /// whether (and to what) a promise has settled.
    pub fn peek_ref(&self) -> Option<Outcome<&V, &E>> {
        self.cell.peek_ref()
    }

    /// Await the settled outcome.
    ///
    /// Registers an observer that forwards the outcome through a one-shot
    /// channel, so this never busy-polls: the channel's waker is what wakes
    /// the awaiting task.
    pub async fn result(&self) -> Outcome<V, E>
    where
        V: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.cell.enqueue_observer(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }));
        match rx.await {
            Ok(outcome) => outcome,
            // The sender side is only ever dropped without sending if the
            // cell itself was dropped mid-observer-drain, which cannot
            // happen: `Cell::drop` always delivers before the stack frame
            // unwinds. Treat it as cancellation defensively regardless.
            Err(_) => Outcome::Cancelled,
        }
    }

    /// Register a raw observer callback, run on whatever thread settles the
    /// cell (or immediately, inline, if already settled). Building block for
    /// [`crate::combinators`]; most callers want a combinator instead.
    pub fn on_settle<F>(&self, callback: F)
    where
        V: Clone,
        E: Clone,
        F: FnOnce(Outcome<V, E>) + Send + 'static,
    {
        self.cell.enqueue_observer(Box::new(callback));
    }

    /// Register a callback that fires the first time this promise is asked
    /// to cancel, independent of whether cancellation is ultimately honored.
    pub fn on_cancel_requested<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cell.enqueue_cancel_request(Box::new(callback));
    }

    pub(crate) fn cell(&self) -> &Arc<Cell<V, E>> {
        &self.cell
    }

    pub fn debug_label(&self) -> Option<&'static str> {
        self.cell.debug_label
    }
}

/// The producer-side handle. Settling methods are idempotent in the sense
/// that only the first winning call has any effect; later calls are
/// silently ignored (mirrors [`Cell::resolve`]'s `bool` return, discarded
/// here since callers rarely need it).
pub struct Resolver<V, E> {
    cell: Arc<Cell<V, E>>,
}

impl<V, E> Clone for Resolver<V, E> {
    fn clone(&self) -> Self {
        Resolver { cell: self.cell.clone() }
    }
}

impl<V, E> Resolver<V, E> {
    pub fn resolve(&self, value: V)
    where
        V: Clone,
        E: Clone,
    {
        self.cell.resolve(Outcome::Value(value));
    }

    pub fn reject(&self, error: E)
    where
        V: Clone,
        E: Clone,
    {
        self.cell.resolve(Outcome::Error(error));
    }

    /// Settle the promise to [`Outcome::Cancelled`] outright (spec.md §5) —
    /// unlike [`Promise::cancel`], which is only advisory, this is the
    /// resolver's own decision to actually finalize cancellation.
    pub fn cancel(&self) {
        self.cell.cancel();
    }

    /// `true` once cancellation has been requested against this promise,
    /// whether or not it has gone on to actually settle (spec.md §6).
    pub fn has_requested_cancel(&self) -> bool {
        self.cell.has_requested_cancel()
    }

    /// Register `f` to run the first time cancellation is requested
    /// (spec.md §6), dispatched through `ctx` with a fresh clone of this
    /// resolver so `f` can decide whether, and when, to follow up by
    /// calling [`Resolver::cancel`].
    pub fn on_request_cancel<F>(&self, ctx: &Context, f: F)
    where
        V: Send + 'static,
        E: Send + 'static,
        F: FnOnce(&Resolver<V, E>) + Send + 'static,
    {
        let resolver = self.clone();
        let ctx = ctx.clone();
        self.cell.enqueue_cancel_request(Box::new(move || {
            ctx.execute(false, Box::new(move |_is_sync| f(&resolver)));
        }));
    }

    pub(crate) fn cell(&self) -> &Arc<Cell<V, E>> {
        &self.cell
    }

    /// Settle with a full [`Outcome`], including [`Outcome::Cancelled`] —
    /// unlike [`Resolver::resolve`]/[`Resolver::reject`], which can only
    /// produce a value or an error. Combinators use this to forward a
    /// parent's outcome verbatim. An [`Outcome::Cancelled`] here settles
    /// outright, the same as [`Resolver::cancel`], not merely advisory.
    pub fn settle(&self, outcome: Outcome<V, E>)
    where
        V: Clone,
        E: Clone,
    {
        match outcome {
            Outcome::Cancelled => self.cell.cancel(),
            other => {
                self.cell.resolve(other);
            }
        }
    }

    /// Move a cell created via [`Promise::delayed`] from `Delayed` to
    /// `Empty`, allowing it to be settled. A no-op otherwise.
    pub fn start(&self) {
        self.cell.start();
    }

    /// Pipe another promise's eventual outcome into this resolver.
    /// Equivalent to `other.on_settle(move |o| match o { ... })` but reads
    /// better at call sites chaining promises together.
    pub fn resolve_with(&self, other: &Promise<V, E>)
    where
        V: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        let cell = self.cell.clone();
        other.cell().enqueue_observer(Box::new(move |outcome| match outcome {
            Outcome::Value(v) => {
                cell.resolve(Outcome::Value(v));
            }
            Outcome::Error(e) => {
                cell.resolve(Outcome::Error(e));
            }
            Outcome::Cancelled => cell.cancel(),
        }));
    }
}

/// Create a fresh, unsettled promise together with its resolver.
pub fn promise_with_resolver<V, E>(debug_label: Option<&'static str>) -> (Promise<V, E>, Resolver<V, E>) {
    let cell = Arc::new(Cell::new(debug_label));
    let resolver = Resolver { cell: cell.clone() };
    (Promise::from_cell(cell), resolver)
}

/// Create a cold promise that will not accept a settlement until
/// [`Resolver::start`] is called (spec.md's `DelayedPromise`).
pub fn delayed<V, E>(debug_label: Option<&'static str>) -> (Promise<V, E>, Resolver<V, E>) {
    let cell = Arc::new(Cell::delayed(debug_label));
    let resolver = Resolver { cell: cell.clone() };
    (Promise::from_cell(cell), resolver)
}

/// Run `job` on `context` and resolve a fresh promise with its result.
pub fn promise_on<V, E, F>(context: &Context, debug_label: Option<&'static str>, job: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce() -> Outcome<V, E> + Send + 'static,
{
    let (promise, resolver) = promise_with_resolver(debug_label);
    context.execute(
        false,
        Box::new(move |_is_synchronous| {
            resolver.cell.resolve(job());
        }),
    );
    promise
}

impl<V, E> Promise<V, E> {
    pub fn fulfilled(value: V) -> Self
    where
        V: Clone + 'static,
        E: Clone + 'static,
    {
        let cell = Arc::new(Cell::new(None));
        cell.resolve(Outcome::Value(value));
        Promise::from_cell(cell)
    }

    pub fn rejected(error: E) -> Self
    where
        V: Clone + 'static,
        E: Clone + 'static,
    {
        let cell = Arc::new(Cell::new(None));
        cell.resolve(Outcome::Error(error));
        Promise::from_cell(cell)
    }

    pub fn cancelled() -> Self
    where
        V: 'static,
        E: 'static,
    {
        let cell = Arc::new(Cell::new(None));
        cell.cancel();
        Promise::from_cell(cell)
    }
}
