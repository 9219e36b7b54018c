//! The promise cell (C2) — the state machine every promise handle type in
//! [`crate::promise`] is built around.
//!
//! `Cell` is deliberately token-agnostic: invalidation tokens (C4) are a
//! side-channel that combinators wire in by wrapping the observer closure
//! they register here, not something this module knows about.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;

use crate::list::{PushResult, Stack};

/// The settled value of a promise: unlike [`std::result::Result`] this is a
/// tri-state, since cancellation is not an error (spec.md §3, *Outcome*).
pub enum Outcome<V, E> {
    Value(V),
    Error(E),
    Cancelled,
}

impl<V: Clone, E: Clone> Clone for Outcome<V, E> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Value(v) => Outcome::Value(v.clone()),
            Outcome::Error(e) => Outcome::Error(e.clone()),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

impl<V: fmt::Debug, E: fmt::Debug> fmt::Debug for Outcome<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Outcome::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Outcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl<V: PartialEq, E: PartialEq> PartialEq for Outcome<V, E> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Outcome::Value(a), Outcome::Value(b)) => a == b,
            (Outcome::Error(a), Outcome::Error(b)) => a == b,
            (Outcome::Cancelled, Outcome::Cancelled) => true,
            _ => false,
        }
    }
}

impl<V, E> Outcome<V, E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn as_result(self) -> Result<Result<V, E>, ()> {
        match self {
            Outcome::Value(v) => Ok(Ok(v)),
            Outcome::Error(e) => Ok(Err(e)),
            Outcome::Cancelled => Err(()),
        }
    }
}

/// Lifecycle states (spec.md §3, *State machine*).
///
/// `Delayed` precedes `Empty` only for promises created via
/// [`crate::promise::Promise::delayed`]; every other construction path
/// starts directly at `Empty`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Delayed = 0,
    Empty = 1,
    Resolving = 2,
    Resolved = 3,
    Cancelling = 4,
    Cancelled = 5,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Delayed,
            1 => State::Empty,
            2 => State::Resolving,
            3 => State::Resolved,
            4 => State::Cancelling,
            5 => State::Cancelled,
            _ => unreachable!("invalid Cell state byte {v}"),
        }
    }
}

/// Observer liveness accounting used to drive automatic upward cancellation
/// (spec.md §9, "observer refcounting"). Two independent concerns, tracked
/// separately:
///
/// - `promise_handles`: how many live [`crate::promise::Promise`] clones
///   exist. Driven exclusively by `Promise`'s `Clone`/`Drop` impls. Reaching
///   zero *seals* the cell: no [`crate::promise::Promise`] handle can ever
///   reappear to register a new child against it.
/// - `word`: bit 63 is the sealed flag set by that same event; bits 0..63
///   count live cancel-propagating child observers, registered by
///   combinators (`crate::combinators::link_cancel_upward`) when a child
///   promise is spawned and released when that child itself propagates a
///   cancel request upward.
///
/// A cell auto-cancels only once *both* are true: sealed (no handle will
/// ever show up to keep it alive) and the child count has hit zero (no
/// still-pending child could yet deliver a different outcome).
struct ObserverCounter {
    promise_handles: CachePadded<AtomicU64>,
    word: CachePadded<AtomicU64>,
}

const SEALED_BIT: u64 = 1 << 63;
const COUNT_MASK: u64 = SEALED_BIT - 1;

impl ObserverCounter {
    fn new() -> Self {
        Self {
            promise_handles: CachePadded::new(AtomicU64::new(0)),
            word: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Mark that the first `Promise` handle now exists. Called once, by
    /// whichever constructor hands out that handle.
    fn attach_handle(&self) {
        self.promise_handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a new `Promise` clone.
    fn register_handle(&self) {
        self.promise_handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a `Promise` clone being dropped. Returns `true` exactly when
    /// this was the last one — the caller should seal the cell.
    fn release_handle(&self) -> bool {
        let prev = self.promise_handles.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "promise handle counter underflow");
        prev == 1
    }

    /// Seal the cell (no further `Promise` handle can ever appear). Returns
    /// `true` if no cancel-propagating child observer is currently
    /// registered either — nobody is left who could ever produce a
    /// different outcome.
    fn seal(&self) -> bool {
        let prev = self.word.fetch_or(SEALED_BIT, Ordering::AcqRel);
        (prev & COUNT_MASK) == 0
    }

    /// A child combinator registered a cancel-propagating observer on this
    /// cell (`crate::combinators::link_cancel_upward`, at child-spawn time).
    fn register_child(&self) {
        self.word.fetch_add(1, Ordering::AcqRel);
    }

    /// That child observer propagated its own cancellation upward. Returns
    /// `true` exactly when this was the last pending child *and* the cell
    /// is already sealed — the caller should cancel the cell.
    fn propagate_child_cancel(&self) -> bool {
        let prev = self.word.fetch_sub(1, Ordering::AcqRel);
        let prev_count = prev & COUNT_MASK;
        debug_assert!(prev_count > 0, "child observer counter underflow");
        (prev & SEALED_BIT) != 0 && prev_count == 1
    }
}

type ObserverFn<V, E> = Box<dyn FnOnce(Outcome<V, E>) + Send>;
type CancelRequestFn = Box<dyn FnOnce() + Send>;

/// The shared, reference-counted core of every promise handle.
///
/// Generic over `V: Clone, E: Clone`: a settled outcome can be observed by
/// an arbitrary number of registered callbacks, and — unlike the
/// garbage-collected language this design traces back to — Rust has no way
/// to hand the same heap value to N observers without either cloning it or
/// wrapping it behind `Arc`. Cloning the outcome keeps the common case (one
/// or a handful of observers) simple; callers who want `Arc`-sharing
/// semantics for an expensive `V` can instantiate `Cell<Arc<T>, E>`
/// themselves, the same trick [`futures::future::Shared`] relies on.
pub struct Cell<V, E> {
    state: CachePadded<AtomicU8>,
    outcome: UnsafeCell<Option<Outcome<V, E>>>,
    callbacks: Stack<ObserverFn<V, E>>,
    cancel_requests: Stack<CancelRequestFn>,
    observers: ObserverCounter,
    pub debug_label: Option<&'static str>,
}

// Safety: `outcome` is only written during the CAS-guarded transition into
// `Resolved`/`Cancelled` (sole-writer, established by winning the CAS into
// `Resolving`/`Cancelling` first) and only read after that transition is
// visible, so there is never concurrent access.
unsafe impl<V: Send, E: Send> Send for Cell<V, E> {}
unsafe impl<V: Send, E: Send> Sync for Cell<V, E> {}

impl<V, E> Cell<V, E> {
    pub fn new(debug_label: Option<&'static str>) -> Self {
        Self::with_initial_state(State::Empty, debug_label)
    }

    pub fn delayed(debug_label: Option<&'static str>) -> Self {
        Self::with_initial_state(State::Delayed, debug_label)
    }

    fn with_initial_state(state: State, debug_label: Option<&'static str>) -> Self {
        Cell {
            state: CachePadded::new(AtomicU8::new(state as u8)),
            outcome: UnsafeCell::new(None),
            callbacks: Stack::new(),
            cancel_requests: Stack::new(),
            observers: ObserverCounter::new(),
            debug_label,
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move a `Delayed` cell to `Empty`, allowing it to be settled. A no-op
    /// if the cell was not created via [`Cell::delayed`].
    pub fn start(&self) {
        let _ = self.state.compare_exchange(
            State::Delayed as u8,
            State::Empty as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state(), State::Resolved | State::Cancelled)
    }

    /// Register the first handle. Must be called exactly once by whichever
    /// constructor creates the cell, before it is shared.
    pub fn mark_alive(&self) {
        self.observers.attach_handle();
    }

    /// Record that a new handle clone now exists.
    pub fn register_handle(&self) {
        self.observers.register_handle();
    }

    /// Record that a `Promise` handle clone was dropped. If this was the
    /// last one, the cell seals: no handle can ever appear again to keep it
    /// alive. If sealing also finds no cancel-propagating child observer
    /// still registered, nobody is left who could ever produce a different
    /// outcome, so the cell cancels outright (spec.md §9, observer
    /// refcounting) — unlike an externally requested cancel, there is no
    /// resolver left to consult, so this finalizes immediately rather than
    /// only requesting.
    pub fn release_handle(&self) {
        if self.observers.release_handle() && self.observers.seal() && !self.is_settled() {
            log::trace!(
                "cell[{:?}]: last handle released, no pending children, auto-cancelling",
                self.debug_label
            );
            self.cancel();
        }
    }

    /// A combinator registered a cancel-propagating child observer against
    /// this cell (`crate::combinators::link_cancel_upward`, at child-spawn
    /// time).
    pub fn register_cancel_propagating_child(&self) {
        self.observers.register_child();
    }

    /// That child observer's own cancellation request propagated upward. If
    /// this was the last pending child and the cell is already sealed (no
    /// `Promise` handle can ever reappear), nobody is left who could still
    /// decide the outcome, so the cell cancels outright — the same
    /// finalize-immediately reasoning as the handle-exhaustion path in
    /// [`Cell::release_handle`].
    pub fn propagate_child_cancel(&self) {
        if self.observers.propagate_child_cancel() && !self.is_settled() {
            log::trace!(
                "cell[{:?}]: last pending child propagated cancel after seal, auto-cancelling",
                self.debug_label
            );
            self.cancel();
        }
    }

    /// Settle the cell with a value or error. Returns `false` if the cell
    /// was already settled. Unlike an initial draft of this method, a
    /// resolve attempt is also allowed to win against an in-flight
    /// *advisory* cancel request (`Cancelling`) — spec.md §5: "a cancel
    /// request may race with resolution; resolution wins" — since
    /// `request_cancel` alone never settles anything, only [`Cell::cancel`]
    /// does, and that race is still decided by whichever CAS lands first.
    pub fn resolve(&self, outcome: Outcome<V, E>) -> bool
    where
        V: Clone,
        E: Clone,
    {
        debug_assert!(!matches!(outcome, Outcome::Cancelled), "use cancel() for that");
        log::trace!("cell[{:?}]: resolve requested", self.debug_label);
        // Claim the writer slot before touching `outcome`: the CAS itself is
        // what grants sole-writer access, so no two resolve attempts (nor a
        // concurrent `cancel()`) can ever write `self.outcome` concurrently.
        let won_from_empty = self
            .state
            .compare_exchange(State::Empty as u8, State::Resolving as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        let won = won_from_empty
            || self
                .state
                .compare_exchange(State::Cancelling as u8, State::Resolving as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
        if !won {
            log::trace!("cell[{:?}]: resolve lost the race, already settling/settled", self.debug_label);
            return false;
        }
        // Safety: we hold the sole-writer right granted by the CAS above;
        // nobody else can be writing `outcome` until we publish `Resolved`.
        unsafe {
            *self.outcome.get() = Some(outcome);
        }
        self.state.store(State::Resolved as u8, Ordering::Release);
        log::trace!("cell[{:?}]: resolved (won race against any in-flight cancel request)", self.debug_label);
        self.finish();
        true
    }

    /// Request cancellation — advisory only (spec.md §5, §6): fires every
    /// registered cancel-request closure, but does *not* by itself settle
    /// the cell. Moves `Delayed`/`Empty` to `Cancelling`; a no-op once
    /// resolution or cancellation is already under way or complete.
    /// Whoever holds the resolver decides whether, and when, to follow up
    /// with [`Cell::cancel`].
    pub fn request_cancel(&self) {
        log::trace!("cell[{:?}]: cancel requested (advisory)", self.debug_label);
        loop {
            match self.state() {
                State::Delayed => {
                    if self
                        .state
                        .compare_exchange(State::Delayed as u8, State::Cancelling as u8, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.fire_cancel_requests();
                        return;
                    }
                }
                State::Empty => {
                    if self
                        .state
                        .compare_exchange(State::Empty as u8, State::Cancelling as u8, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.fire_cancel_requests();
                        return;
                    }
                    // Lost the race (something else moved state on); retry.
                }
                State::Cancelling | State::Resolving | State::Resolved | State::Cancelled => {
                    log::trace!(
                        "cell[{:?}]: cancel request is a no-op, already requested/settling/settled",
                        self.debug_label
                    );
                    return;
                }
            }
        }
    }

    fn fire_cancel_requests(&self) {
        for request in self.cancel_requests.swap_and_seal().into_vec_reversed() {
            request();
        }
    }

    /// `true` once a cancel request has been made (advisory or settled),
    /// whether or not it has actually settled the cell yet.
    pub fn has_requested_cancel(&self) -> bool {
        matches!(self.state(), State::Cancelling | State::Cancelled)
    }

    /// Explicit settle-to-cancelled step (spec.md §5): ensures the advisory
    /// phase has run, then moves the cell to its terminal `Cancelled` state
    /// and delivers [`Outcome::Cancelled`] to every registered observer. A
    /// no-op if something else already resolved or cancelled the cell
    /// first — including a concurrent [`Cell::resolve`] that wins the race.
    pub fn cancel(&self) {
        self.request_cancel();
        if self
            .state
            .compare_exchange(State::Cancelling as u8, State::Cancelled as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::trace!("cell[{:?}]: cancelled", self.debug_label);
            self.settle_cancelled();
        }
    }

    fn settle_cancelled(&self) {
        // Safety: granted by winning the CAS into `Cancelled` in `cancel`.
        unsafe {
            *self.outcome.get() = Some(Outcome::Cancelled);
        }
        // `Outcome::Cancelled` carries no payload, so every observer can get
        // a freshly constructed one without needing `V: Clone, E: Clone` —
        // that bound only matters when a real value/error must be multicast.
        // Keeping this path unbounded is what lets `Promise::drop` (which
        // cannot add bounds beyond the struct's own, unbounded definition)
        // call down into cancellation without requiring `V`/`E` to be `Clone`.
        for callback in self.callbacks.swap_and_seal().into_vec_reversed() {
            callback(Outcome::Cancelled);
        }
    }

    /// Drain and invoke every registered observer exactly once, in
    /// registration order. Only reachable from [`Cell::resolve`] — a
    /// successful resolve never drains `cancel_requests`; those only ever
    /// fire from the advisory phase in [`Cell::request_cancel`], so a
    /// resolve that wins the race against a prior cancel request does not
    /// retroactively fire them a second time.
    fn finish(&self)
    where
        V: Clone,
        E: Clone,
    {
        self.drain_callbacks();
    }

    fn drain_callbacks(&self)
    where
        V: Clone,
        E: Clone,
    {
        for callback in self.callbacks.swap_and_seal().into_vec_reversed() {
            let outcome = self.clone_outcome_unchecked();
            callback(outcome);
        }
    }

    /// Safety precondition: only valid once the cell is settled.
    fn clone_outcome_unchecked(&self) -> Outcome<V, E>
    where
        V: Clone,
        E: Clone,
    {
        // Safety: settled means no further writer exists; shared reads are
        // sound.
        let outcome = unsafe { &*self.outcome.get() };
        outcome
            .as_ref()
            .expect("clone_outcome_unchecked called before settlement")
            .clone()
    }

    /// Register an observer to run once the cell settles. If the cell is
    /// already settled, the callback is invoked immediately (still on the
    /// calling thread — the caller's own dispatch wrapper decides whether
    /// that is acceptable or needs to re-hop through a [`crate::context::Context`]).
    pub fn enqueue_observer(&self, callback: ObserverFn<V, E>)
    where
        V: Clone,
        E: Clone,
    {
        match self.callbacks.push(callback) {
            PushResult::Pushed => {
                // The cell may have settled concurrently with this push; if
                // so, the settling thread's `drain_callbacks` may have
                // already run before we landed, or may still be about to.
                // Either is fine: `swap_and_seal` is the single linearization
                // point, so exactly one of "our push lands before the seal"
                // or "the seal already happened and our push saw `Sealed`"
                // is true — never both un-delivered.
            }
            PushResult::Sealed(callback) => {
                let outcome = self.clone_outcome_unchecked();
                callback(outcome);
            }
        }
    }

    /// Register a callback to run exactly once, the first time this cell's
    /// cancellation is requested (advisory phase — [`Cell::request_cancel`]
    /// or [`Cell::cancel`]), independent of whether the cell ultimately
    /// settles to `Cancelled` or a concurrent resolve wins the race.
    pub fn enqueue_cancel_request(&self, callback: CancelRequestFn) {
        match self.cancel_requests.push(callback) {
            PushResult::Pushed => {}
            PushResult::Sealed(callback) => callback(),
        }
    }

    /// Synchronous peek: `Some(outcome)` if already settled, without
    /// registering an observer. Used by `result_sync()` on the handle types.
    pub fn peek_sync(&self) -> Option<Outcome<V, E>>
    where
        V: Clone,
        E: Clone,
    {
        if self.is_settled() {
            Some(self.clone_outcome_unchecked())
        } else {
            None
        }
    }

    /// Zero-clone peek: `Some(outcome)` borrowing the settled value/error
    /// rather than cloning it. Needs no `V: Clone, E: Clone` bound at all —
    /// unlike `peek_sync`, nothing is ever duplicated.
    pub fn peek_ref(&self) -> Option<Outcome<&V, &E>> {
        if !self.is_settled() {
            return None;
        }
        // Safety: settled means no further writer exists; shared reads are
        // sound for as long as `&self` is held.
        let outcome = unsafe { &*self.outcome.get() };
        outcome.as_ref().map(|o| match o {
            Outcome::Value(v) => Outcome::Value(v),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Cancelled => Outcome::Cancelled,
        })
    }
}

impl<V, E> Drop for Cell<V, E> {
    fn drop(&mut self) {
        // Invariant I6: a cell dropped while non-terminal must still deliver
        // `Cancelled` to anything that registered, since nothing will ever
        // observe it otherwise.
        if !self.is_settled() {
            self.state.store(State::Cancelled as u8, Ordering::Release);
            // Safety: exclusive access via `&mut self`.
            unsafe {
                *self.outcome.get() = Some(Outcome::Cancelled);
            }
        }
        for request in self.cancel_requests.swap_and_seal().into_vec_reversed() {
            request();
        }
        for callback in self.callbacks.swap_and_seal().into_vec_reversed() {
            // Safety: outcome was just forced to `Some` above if it wasn't
            // already; exclusive access via `&mut self`.
            let outcome = unsafe { (*self.outcome.get()).take() };
            let outcome = match outcome {
                Some(o) => o,
                None => Outcome::Cancelled,
            };
            callback(outcome);
            // `take()` above only leaves a value for the first iteration;
            // subsequent observers in a dropped, never-settled cell all get
            // a fresh `Cancelled` rather than sharing one taken value, since
            // we can't clone without `V: Clone, E: Clone` bounds here.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn settled_value(cell: &Cell<i32, String>) -> Outcome<i32, String> {
        cell.peek_sync().expect("expected cell to be settled")
    }

    #[test]
    fn resolve_then_observer_runs_immediately() {
        let cell: Cell<i32, String> = Cell::new(None);
        assert!(cell.resolve(Outcome::Value(7)));
        assert_eq!(settled_value(&cell), Outcome::Value(7));

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        cell.enqueue_observer(Box::new(move |outcome| {
            if let Outcome::Value(v) = outcome {
                seen2.store(v as usize, Ordering::SeqCst);
            }
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn observer_registered_before_resolve_runs_on_settle() {
        let cell: Cell<i32, String> = Cell::new(None);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        cell.enqueue_observer(Box::new(move |outcome| {
            if let Outcome::Value(v) = outcome {
                seen2.store(v as usize, Ordering::SeqCst);
            }
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        cell.resolve(Outcome::Value(9));
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn second_resolve_is_rejected() {
        let cell: Cell<i32, String> = Cell::new(None);
        assert!(cell.resolve(Outcome::Value(1)));
        assert!(!cell.resolve(Outcome::Value(2)));
        assert_eq!(settled_value(&cell), Outcome::Value(1));
    }

    #[test]
    fn request_cancel_is_advisory_only_and_does_not_settle() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.request_cancel();
        assert!(!cell.is_settled());
        assert!(cell.has_requested_cancel());
        assert_eq!(cell.peek_sync(), None);
    }

    #[test]
    fn cancel_on_empty_cell_settles_cancelled() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.cancel();
        assert_eq!(settled_value(&cell), Outcome::Cancelled);
    }

    #[test]
    fn resolve_wins_race_against_prior_advisory_cancel_request() {
        // spec.md §5: a cancel request may race with resolution —
        // resolution wins. `request_cancel` alone only moves the cell to
        // `Cancelling`; a concurrent `resolve` can still claim the cell
        // before anything calls the explicit `cancel()` settle step.
        let cell: Cell<i32, String> = Cell::new(None);
        cell.request_cancel();
        assert!(cell.resolve(Outcome::Value(1)));
        assert_eq!(settled_value(&cell), Outcome::Value(1));
    }

    #[test]
    fn resolve_after_full_cancel_is_rejected() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.cancel();
        assert!(!cell.resolve(Outcome::Value(1)));
        assert_eq!(settled_value(&cell), Outcome::Cancelled);
    }

    #[test]
    fn cancel_requests_do_not_fire_on_a_plain_resolve() {
        let cell: Cell<i32, String> = Cell::new(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        cell.enqueue_cancel_request(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        cell.resolve(Outcome::Value(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_requests_fire_on_request_cancel_even_if_resolve_later_wins() {
        let cell: Cell<i32, String> = Cell::new(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        cell.enqueue_cancel_request(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        cell.request_cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(cell.resolve(Outcome::Value(1)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delayed_cell_is_not_settleable_until_started() {
        let cell: Cell<i32, String> = Cell::delayed(None);
        assert!(!cell.is_settled());
        assert!(!cell.resolve(Outcome::Value(1)));
        cell.start();
        assert!(cell.resolve(Outcome::Value(1)));
    }

    #[test]
    fn drop_without_settling_delivers_cancelled_to_observers() {
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let cell: Cell<i32, String> = Cell::new(None);
            let seen2 = seen.clone();
            cell.enqueue_observer(Box::new(move |outcome| {
                if outcome.is_cancelled() {
                    seen2.store(1, Ordering::SeqCst);
                }
            }));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausting_handles_before_settlement_requests_cancel() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.mark_alive(); // first handle, count == 1
        cell.register_handle(); // a clone, count == 2
        cell.release_handle(); // drop the clone, count == 1
        cell.release_handle(); // drop the original, count == 0 -> cancel
        assert_eq!(settled_value(&cell), Outcome::Cancelled);
    }

    #[test]
    fn releasing_handle_after_settle_does_not_recancel() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.mark_alive();
        cell.resolve(Outcome::Value(5));
        cell.release_handle();
        assert_eq!(settled_value(&cell), Outcome::Value(5));
    }

    #[test]
    fn releasing_handle_with_a_pending_child_does_not_cancel_yet() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.mark_alive();
        cell.register_cancel_propagating_child();
        cell.release_handle();
        // Sealed (no handle left), but a child observer is still pending —
        // nobody has said there's truly nobody left yet.
        assert!(!cell.is_settled());
    }

    #[test]
    fn propagate_child_cancel_after_seal_and_last_child_cancels() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.mark_alive();
        cell.register_cancel_propagating_child();
        cell.release_handle();
        assert!(!cell.is_settled());

        cell.propagate_child_cancel();
        assert_eq!(settled_value(&cell), Outcome::Cancelled);
    }

    #[test]
    fn propagate_child_cancel_before_seal_does_not_cancel() {
        let cell: Cell<i32, String> = Cell::new(None);
        cell.mark_alive(); // handle still live, never sealed
        cell.register_cancel_propagating_child();
        cell.propagate_child_cancel();
        assert!(!cell.is_settled());
    }
}
