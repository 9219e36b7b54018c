//! The combinator table (C5, spec.md §4.5).
//!
//! Every combinator here follows the same shape: create a child cell,
//! register exactly one observer on the parent that (a) checks the token
//! gate, if any, at dispatch time and (b) either runs the user closure and
//! settles the child, or — for transforming combinators — cancels the child
//! outright when the gate has closed. The child's cancel-request listener
//! forwards upward to the parent through a weak handle, so cancelling a
//! child never keeps its parent alive on its own — and that forwarding is
//! itself gated by the parent's observer refcount (spec.md §9): it only
//! actually reaches the parent once the parent is sealed (its own last
//! handle dropped) and no other child is still pending.

use std::sync::Arc;

use crate::cell::{Cell, Outcome};
use crate::context::Context;
use crate::promise::{promise_with_resolver, Promise, Resolver};
use crate::token::Token;

type Gate = Option<crate::token::TokenGate>;

fn gate_open(gate: &Gate) -> bool {
    gate.as_ref().map_or(true, |g| !g.is_invalidated())
}

/// Wire a child's cancel-request listener to forward to `parent` through a
/// weak handle, gated by the parent's observer refcount (spec.md §9,
/// "observer refcounting"): registers one cancel-propagating child observer
/// against the parent at spawn time, and on the child's own cancel request,
/// tells the parent that observer is going away. The parent only actually
/// cancels once it is sealed (its own last `Promise` handle has been
/// dropped) *and* this was its last pending child — while the caller still
/// holds a live handle onto the parent, cancelling a child never reaches it
/// (spec.md §8, scenario 2).
fn link_cancel_upward<V, E>(child: &Promise<V, E>, parent_cell: &Arc<Cell<V, E>>) {
    parent_cell.register_cancel_propagating_child();
    let parent_weak = Arc::downgrade(parent_cell);
    child.on_cancel_requested(move || {
        if let Some(parent) = parent_weak.upgrade() {
            parent.propagate_child_cancel();
        }
    });
}

/// Shared scaffolding: register one observer on `parent` that dispatches
/// through `ctx`, reloads the token gate at dispatch time, and hands the
/// resolved `(Outcome, gate_open)` pair to `settle`.
fn spawn_child<V, E, V2, E2>(
    parent: &Promise<V, E>,
    ctx: Context,
    token: Option<&Token>,
    settle: impl FnOnce(Outcome<V, E>, bool, &Resolver<V2, E2>) + Send + 'static,
) -> Promise<V2, E2>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    V2: Send + 'static,
    E2: Send + 'static,
{
    let (child, resolver) = promise_with_resolver(None);
    link_cancel_upward(&child, parent.cell());
    // A combinator child's resolver is internal to this module — nothing
    // outside ever holds it to decide whether to honor a cancel request —
    // so requesting cancellation on the child always finalizes it.
    let finalize_cell = child.cell().clone();
    child.on_cancel_requested(move || finalize_cell.cancel());
    let gate = token.map(|t| t.gate());
    parent.on_settle(move |outcome| {
        ctx.execute(
            false,
            Box::new(move |_is_sync| {
                let open = gate_open(&gate);
                settle(outcome, open, &resolver);
            }),
        );
    });
    child
}

/// `then(f)`: run `f` for its side effect only (gated); child always mirrors
/// the parent's outcome regardless of whether `f` ran.
pub fn then<V, E, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(&Outcome<V, E>) + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| {
        if open {
            f(&outcome);
        }
        resolver.settle(outcome);
    })
}

/// `map(f)`: transform a `Value`; pass `Error`/`Cancelled` through
/// unchanged. If the gate has closed, the child is cancelled instead of
/// `f` running.
pub fn map<V, E, V2, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V2, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    V2: Clone + Send + 'static,
    F: FnOnce(V) -> V2 + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Value(v) if open => resolver.settle(Outcome::Value(f(v))),
        Outcome::Value(_) => resolver.settle(Outcome::Cancelled),
        Outcome::Error(e) => resolver.settle(Outcome::Error(e)),
        Outcome::Cancelled => resolver.settle(Outcome::Cancelled),
    })
}

/// `try_map(f)`: like [`map`], but `f` may itself fail, adopting the
/// returned error as the child's rejection.
pub fn try_map<V, E, V2, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V2, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    V2: Clone + Send + 'static,
    F: FnOnce(V) -> Result<V2, E> + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Value(v) if open => match f(v) {
            Ok(v2) => resolver.settle(Outcome::Value(v2)),
            Err(e) => resolver.settle(Outcome::Error(e)),
        },
        Outcome::Value(_) => resolver.settle(Outcome::Cancelled),
        Outcome::Error(e) => resolver.settle(Outcome::Error(e)),
        Outcome::Cancelled => resolver.settle(Outcome::Cancelled),
    })
}

/// `flat_map(f)`: on `Value`, pipe `f(v)`'s eventual outcome into the
/// child; `Error`/`Cancelled` pass through unchanged.
pub fn flat_map<V, E, V2, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V2, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    V2: Clone + Send + 'static,
    F: FnOnce(V) -> Promise<V2, E> + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Value(v) if open => resolver.resolve_with(&f(v)),
        Outcome::Value(_) => resolver.settle(Outcome::Cancelled),
        Outcome::Error(e) => resolver.settle(Outcome::Error(e)),
        Outcome::Cancelled => resolver.settle(Outcome::Cancelled),
    })
}

/// `try_flat_map(f)`: like [`flat_map`], but `f` may synchronously fail
/// before ever producing a promise to pipe from.
pub fn try_flat_map<V, E, V2, F>(
    parent: &Promise<V, E>,
    ctx: Context,
    token: Option<&Token>,
    f: F,
) -> Promise<V2, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    V2: Clone + Send + 'static,
    F: FnOnce(V) -> Result<Promise<V2, E>, E> + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Value(v) if open => match f(v) {
            Ok(p) => resolver.resolve_with(&p),
            Err(e) => resolver.settle(Outcome::Error(e)),
        },
        Outcome::Value(_) => resolver.settle(Outcome::Cancelled),
        Outcome::Error(e) => resolver.settle(Outcome::Error(e)),
        Outcome::Cancelled => resolver.settle(Outcome::Cancelled),
    })
}

/// `catch(f)`: run `f` on `Error` for its side effect; child mirrors the
/// parent's outcome either way.
pub fn catch<V, E, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(&E) + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| {
        if open {
            if let Outcome::Error(e) = &outcome {
                f(e);
            }
        }
        resolver.settle(outcome);
    })
}

/// `recover(f)`: turn an `Error` into a `Value`; `Value`/`Cancelled` pass
/// through. If the gate has closed, the child is cancelled instead.
pub fn recover<V, E, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(E) -> V + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Error(e) if open => resolver.settle(Outcome::Value(f(e))),
        Outcome::Error(_) => resolver.settle(Outcome::Cancelled),
        other => resolver.settle(other),
    })
}

/// `try_recover(f)`: like [`recover`], but `f` may itself fail with a
/// (possibly different) error.
pub fn try_recover<V, E, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(E) -> Result<V, E> + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Error(e) if open => match f(e) {
            Ok(v) => resolver.settle(Outcome::Value(v)),
            Err(e2) => resolver.settle(Outcome::Error(e2)),
        },
        Outcome::Error(_) => resolver.settle(Outcome::Cancelled),
        other => resolver.settle(other),
    })
}

/// `map_error(f)`: transform an `Error`; `Value`/`Cancelled` pass through.
pub fn map_error<V, E, E2, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E2>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    E2: Clone + Send + 'static,
    F: FnOnce(E) -> E2 + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Value(v) => resolver.settle(Outcome::Value(v)),
        Outcome::Error(e) if open => resolver.settle(Outcome::Error(f(e))),
        Outcome::Error(_) => resolver.settle(Outcome::Cancelled),
        Outcome::Cancelled => resolver.settle(Outcome::Cancelled),
    })
}

/// `flat_map_error(f)`: on `Error`, pipe `f(e)`'s eventual outcome into the
/// child; `Value`/`Cancelled` pass through unchanged.
pub fn flat_map_error<V, E, E2, F>(
    parent: &Promise<V, E>,
    ctx: Context,
    token: Option<&Token>,
    f: F,
) -> Promise<V, E2>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    E2: Clone + Send + 'static,
    F: FnOnce(E) -> Promise<V, E2> + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| match outcome {
        Outcome::Value(v) => resolver.settle(Outcome::Value(v)),
        Outcome::Error(e) if open => resolver.resolve_with(&f(e)),
        Outcome::Error(_) => resolver.settle(Outcome::Cancelled),
        Outcome::Cancelled => resolver.settle(Outcome::Cancelled),
    })
}

/// `always(f)`: run `f(&result)` regardless of outcome; child mirrors the
/// parent.
pub fn always<V, E, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(&Outcome<V, E>) + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| {
        if open {
            f(&outcome);
        }
        resolver.settle(outcome);
    })
}

/// `map_result(f)`: transform the whole outcome synchronously, uniformly
/// across `Value`/`Error`/`Cancelled`.
pub fn map_result<V, E, V2, E2, F>(
    parent: &Promise<V, E>,
    ctx: Context,
    token: Option<&Token>,
    f: F,
) -> Promise<V2, E2>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    V2: Clone + Send + 'static,
    E2: Clone + Send + 'static,
    F: FnOnce(Outcome<V, E>) -> Outcome<V2, E2> + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| {
        if open {
            resolver.settle(f(outcome));
        } else {
            resolver.settle(Outcome::Cancelled);
        }
    })
}

/// `flat_map_result(f)`: like [`map_result`], but `f` returns a promise to
/// pipe from rather than an outcome to adopt directly.
pub fn flat_map_result<V, E, V2, E2, F>(
    parent: &Promise<V, E>,
    ctx: Context,
    token: Option<&Token>,
    f: F,
) -> Promise<V2, E2>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    V2: Clone + Send + 'static,
    E2: Clone + Send + 'static,
    F: FnOnce(Outcome<V, E>) -> Promise<V2, E2> + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| {
        if open {
            resolver.resolve_with(&f(outcome));
        } else {
            resolver.settle(Outcome::Cancelled);
        }
    })
}

/// `tap(f)`: run `f` for its side effect (gated); returns `parent` itself,
/// unlike every other combinator, which returns a fresh child (spec.md
/// §4.5 table: "return receiver unchanged").
pub fn tap<V, E, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(&Outcome<V, E>) + Send + 'static,
{
    let gate = token.map(|t| t.gate());
    parent.on_settle(move |outcome| {
        ctx.execute(
            false,
            Box::new(move |_is_sync| {
                if gate_open(&gate) {
                    f(&outcome);
                }
            }),
        );
    });
    parent.clone()
}

/// `tap()` (no-arg): a passthrough child that mirrors the parent but does
/// *not* register a cancel-propagating observer — cancelling this handle
/// never reaches the parent (spec.md §4.5 table).
pub fn tap_passthrough<V, E>(parent: &Promise<V, E>) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let (child, resolver) = promise_with_resolver(None);
    parent.on_settle(move |outcome| resolver.settle(outcome));
    // No `link_cancel_upward` here — that's the entire point of this
    // combinator — but the child's own resolver is still internal to this
    // module, so cancelling the child must still finalize it locally.
    let finalize_cell = child.cell().clone();
    child.on_cancel_requested(move || finalize_cell.cancel());
    child
}

/// `on_cancel(f)`: run `f` only when the parent settles to `Cancelled`;
/// child mirrors the parent.
pub fn on_cancel<V, E, F>(parent: &Promise<V, E>, ctx: Context, token: Option<&Token>, f: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    spawn_child(parent, ctx, token, move |outcome, open, resolver| {
        if outcome.is_cancelled() && open {
            f();
        }
        resolver.settle(outcome);
    })
}

/// `ignoring_cancel()`: a child that mirrors the parent but silently
/// swallows `request_cancel` calls made on the child itself — it never
/// forwards them upward.
pub fn ignoring_cancel<V, E>(parent: &Promise<V, E>) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    // Reuses the no-forwarding passthrough: the only difference from
    // `tap_passthrough` is naming at the call site, since "not linking
    // cancel upward" is exactly "ignore cancel requests on this handle".
    tap_passthrough(parent)
}

/// `propagating_cancellation(on_req)`: a child that mirrors the parent, but
/// whose own cancel-request listener first invokes `on_req` with a handle
/// to the child before forwarding the cancel upward. Unlike every other
/// combinator, this mode bypasses the handle-liveness seal that
/// [`link_cancel_upward`] otherwise gates on — cancelling this child always
/// forwards a real, settling cancellation to the parent immediately,
/// regardless of whether the parent's own handle is still held or other
/// children are still pending (spec.md §4.5 table entry for this mode).
pub fn propagating_cancellation<V, E, F>(parent: &Promise<V, E>, on_req: F) -> Promise<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    F: FnOnce(Promise<V, E>) + Send + 'static,
{
    let (child, resolver) = promise_with_resolver(None);
    parent.on_settle(move |outcome| resolver.settle(outcome));

    let parent_weak = Arc::downgrade(parent.cell());
    let child_for_hook = child.clone();
    child.on_cancel_requested(move || {
        on_req(child_for_hook);
        if let Some(parent) = parent_weak.upgrade() {
            parent.cancel();
        }
    });
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::promise::promise_with_resolver;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn map_transforms_value() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = map(&p, Context::Immediate, None, |v| v * 2);
        r.resolve(21);
        assert_eq!(child.result_sync(), Some(Outcome::Value(42)));
    }

    #[test]
    fn map_passes_error_through() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = map(&p, Context::Immediate, None, |v| v * 2);
        r.reject("bad".to_string());
        assert_eq!(child.result_sync(), Some(Outcome::Error("bad".to_string())));
    }

    #[test]
    fn map_passes_cancellation_through() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = map(&p, Context::Immediate, None, |v| v * 2);
        r.cancel();
        assert_eq!(child.result_sync(), Some(Outcome::Cancelled));
    }

    #[test]
    fn recover_turns_error_into_value() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = recover(&p, Context::Immediate, None, |_e| 0);
        r.reject("bad".to_string());
        assert_eq!(child.result_sync(), Some(Outcome::Value(0)));
    }

    #[test]
    fn then_runs_side_effect_and_mirrors_value() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = then(&p, Context::Immediate, None, move |_| {
            ran2.store(true, Ordering::SeqCst);
        });
        r.resolve(1);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(child.result_sync(), Some(Outcome::Value(1)));
    }

    #[test]
    fn flat_map_pipes_inner_promise() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = flat_map(&p, Context::Immediate, None, |v| Promise::fulfilled(v + 1));
        r.resolve(1);
        assert_eq!(child.result_sync(), Some(Outcome::Value(2)));
    }

    #[test]
    fn try_map_adopts_returned_error() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = try_map(&p, Context::Immediate, None, |v| {
            if v < 0 {
                Err("negative".to_string())
            } else {
                Ok(v)
            }
        });
        r.resolve(-1);
        assert_eq!(child.result_sync(), Some(Outcome::Error("negative".to_string())));
    }

    #[test]
    fn gate_closed_cancels_transforming_child() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let token = Token::new(false);
        let child = map(&p, Context::Immediate, Some(&token), |v| v * 2);
        token.invalidate();
        r.resolve(10);
        assert_eq!(child.result_sync(), Some(Outcome::Cancelled));
    }

    #[test]
    fn gate_closed_on_observer_only_combinator_still_mirrors_outcome() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let token = Token::new(false);
        let child = then(&p, Context::Immediate, Some(&token), move |_| {
            ran2.store(true, Ordering::SeqCst);
        });
        token.invalidate();
        r.resolve(7);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(child.result_sync(), Some(Outcome::Value(7)));
    }

    #[test]
    fn cancelling_child_does_not_forward_while_parent_handle_is_live() {
        // spec.md §8, scenario 2 / §9 observer refcounting: a parent whose
        // own `Promise` handle is still live is never sealed, so a child's
        // cancellation never reaches it no matter how many children exist.
        let (p, _r) = promise_with_resolver::<i32, String>(None);
        let child = map(&p, Context::Immediate, None, |v| v * 2);
        child.cancel();
        assert_eq!(child.result_sync(), Some(Outcome::Cancelled));
        assert_eq!(p.result_sync(), None);
    }

    #[test]
    fn cancelling_child_forwards_to_parent_once_parent_handle_is_released() {
        let (p, r) = promise_with_resolver::<i32, String>(None);
        let child = map(&p, Context::Immediate, None, |v| v * 2);
        drop(p);
        // Sealed, and this is the only registered child; cancelling it
        // propagates upward.
        child.cancel();
        assert_eq!(r.cell().peek_sync(), Some(Outcome::Cancelled));
    }

    #[test]
    fn ignoring_cancel_does_not_forward_to_parent() {
        let (p, _r) = promise_with_resolver::<i32, String>(None);
        let child = ignoring_cancel(&p);
        child.cancel();
        assert_eq!(p.result_sync(), None);
    }

    #[test]
    fn propagating_cancellation_runs_hook_before_parent_cancel() {
        let order = Arc::new(AtomicUsize::new(0));
        let hook_ran_at = Arc::new(AtomicUsize::new(0));
        let (p, _r) = promise_with_resolver::<i32, String>(None);
        let hook_ran_at2 = hook_ran_at.clone();
        let order2 = order.clone();
        let child = propagating_cancellation(&p, move |_child| {
            hook_ran_at2.store(order2.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        });
        child.cancel();
        assert_eq!(hook_ran_at.load(Ordering::SeqCst), 0);
        assert_eq!(p.result_sync(), Some(Outcome::Cancelled));
    }
}
