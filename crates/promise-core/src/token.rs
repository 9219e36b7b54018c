//! Invalidation tokens (C4) — a side-channel gating mechanism distinct from
//! promise lifecycles (spec.md §4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Something that can be told to cancel without holding it alive.
///
/// Combinators register the child promise's [`crate::promise::Cancellable`]
/// here via [`Token::request_cancel_on_invalidate`].
pub trait Cancellable: Send + Sync {
    fn request_cancel(&self);
}

struct ChainedToken {
    token: Weak<Inner>,
    include_cnwi: bool,
}

/// Unlike a [`crate::cell::Cell`]'s callback/cancel-request lists (which are
/// drained exactly once, ever, because a cell settles once), a token's
/// registries are read every time the token is invalidated or
/// cancelled-without-invalidating — and a token can legitimately go through
/// that more than once (an explicit call followed by auto-invalidate-on-drop,
/// or two explicit calls). They need a reusable, multi-consume list rather
/// than `list::Stack`'s single-consume swap-and-seal, so plain
/// `Mutex<Vec<..>>` (the same shape the teacher uses for its own registration
/// lists in `coordinator.rs`) stands in here instead.
struct Inner {
    generation: AtomicU64,
    debug_label: Option<&'static str>,
    cancellables: Mutex<Vec<Weak<dyn Cancellable>>>,
    chained: Mutex<Vec<ChainedToken>>,
}

/// A generation counter plus a list of cancellables to auto-cancel and a
/// chain list of downstream tokens, used to gate and revoke callbacks across
/// promise chains.
///
/// Tokens hold only *weak* references to the cancellables they gate, so
/// registering with a token never keeps a promise alive (spec.md §9, "Token
/// ↔ cancellable double-weak fabric").
#[derive(Clone)]
pub struct Token {
    inner: Arc<Inner>,
    auto_invalidate: bool,
}

impl Token {
    /// Create a token. If `auto_invalidate` is true (the default mode),
    /// dropping the last strong reference to this token invalidates it.
    pub fn new(auto_invalidate: bool) -> Self {
        Self::with_label(auto_invalidate, None)
    }

    pub fn with_label(auto_invalidate: bool, debug_label: Option<&'static str>) -> Self {
        Token {
            inner: Arc::new(Inner {
                generation: AtomicU64::new(0),
                debug_label,
                cancellables: Mutex::new(Vec::new()),
                chained: Mutex::new(Vec::new()),
            }),
            auto_invalidate,
        }
    }

    /// The generation captured by an observer at registration time; compared
    /// against the live generation right before the observer's user closure
    /// would run (spec.md §4.4 "Gating contract").
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// A lightweight capture of this token's identity and generation,
    /// embedded into a gated observer at registration time.
    pub fn gate(&self) -> TokenGate {
        TokenGate {
            inner: Arc::downgrade(&self.inner),
            captured_generation: self.generation(),
        }
    }

    /// Increment the generation, request-cancel every live registered
    /// cancellable, then invalidate every chained child token.
    pub fn invalidate(&self) {
        log::trace!("token[{:?}]: invalidate", self.inner.debug_label);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.cancel_registered();
        self.invalidate_chained();
    }

    /// Request-cancel every live registered cancellable without advancing
    /// the generation, then propagate to chained tokens that opted into
    /// cancel-without-invalidate.
    pub fn cancel_without_invalidating(&self) {
        log::trace!("token[{:?}]: cancel_without_invalidating", self.inner.debug_label);
        self.cancel_registered();
        let chained = self
            .inner
            .chained
            .lock()
            .unwrap()
            .iter()
            .map(|c| ChainedToken {
                token: c.token.clone(),
                include_cnwi: c.include_cnwi,
            })
            .collect::<Vec<_>>();
        for chained in chained {
            if chained.include_cnwi {
                if let Some(child) = chained.token.upgrade() {
                    Token {
                        inner: child,
                        auto_invalidate: false,
                    }
                    .cancel_without_invalidating();
                }
            }
        }
    }

    fn cancel_registered(&self) {
        let registered = std::mem::take(&mut *self.inner.cancellables.lock().unwrap());
        for weak in registered {
            if let Some(c) = weak.upgrade() {
                c.request_cancel();
            }
        }
    }

    fn invalidate_chained(&self) {
        let chained = self
            .inner
            .chained
            .lock()
            .unwrap()
            .iter()
            .map(|c| ChainedToken {
                token: c.token.clone(),
                include_cnwi: c.include_cnwi,
            })
            .collect::<Vec<_>>();
        for chained in chained {
            if let Some(child) = chained.token.upgrade() {
                Token {
                    inner: child,
                    auto_invalidate: false,
                }
                .invalidate();
            }
        }
    }

    /// Register a cancellable to be auto-cancelled when this token
    /// invalidates. Holds only a weak reference. May be called any number of
    /// times across the token's life, including after a prior invalidation —
    /// the registry is never sealed, only drained.
    pub fn request_cancel_on_invalidate(&self, cancellable: Weak<dyn Cancellable>) {
        self.inner.cancellables.lock().unwrap().push(cancellable);
    }

    /// Chain `self` as a downstream child of `parent`: invalidating `parent`
    /// will invalidate `self`. Chain registrations may be re-added after a
    /// prior invalidation; the registry is drained, never sealed.
    pub fn chain_from(&self, parent: &Token, include_cnwi: bool) {
        let weak_self: Weak<Inner> = Arc::downgrade(&self.inner);
        parent.inner.chained.lock().unwrap().push(ChainedToken {
            token: weak_self,
            include_cnwi,
        });
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        // Only the last strong reference triggers auto-invalidate.
        if self.auto_invalidate && Arc::strong_count(&self.inner) == 1 {
            self.invalidate();
        }
    }
}

/// A captured `(token identity, generation)` pair embedded into a gated
/// observer. Reloaded at dispatch time to decide whether the user closure
/// still runs (spec.md §4.4).
#[derive(Clone)]
pub struct TokenGate {
    inner: Weak<Inner>,
    captured_generation: u64,
}

impl TokenGate {
    /// `true` if the token has since invalidated (or been dropped, which
    /// counts as an implicit invalidation once no strong reference remains
    /// to observe otherwise).
    pub fn is_invalidated(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.generation.load(Ordering::Acquire) != self.captured_generation,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct RecordingCancellable(Arc<AtomicBool>);
    impl Cancellable for RecordingCancellable {
        fn request_cancel(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn invalidate_bumps_generation_and_cancels_registered() {
        let token = Token::new(false);
        let gate = token.gate();
        assert!(!gate.is_invalidated());

        let flag = Arc::new(AtomicBool::new(false));
        let cancellable: Arc<dyn Cancellable> = Arc::new(RecordingCancellable(flag.clone()));
        token.request_cancel_on_invalidate(Arc::downgrade(&cancellable));

        token.invalidate();
        assert!(gate.is_invalidated());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn chained_token_invalidates_with_parent() {
        let parent = Token::new(false);
        let child = Token::new(false);
        child.chain_from(&parent, false);
        let child_gate = child.gate();

        parent.invalidate();
        assert!(child_gate.is_invalidated());
    }

    #[test]
    fn auto_invalidate_on_drop() {
        let token = Token::new(true);
        let gate = token.gate();
        drop(token);
        assert!(gate.is_invalidated());
    }

    #[test]
    fn explicit_only_token_survives_drop_without_invalidating() {
        let token = Token::new(false);
        let gate = token.gate();
        drop(token);
        assert!(!gate.is_invalidated());
    }

    #[test]
    fn cancel_without_invalidating_does_not_advance_generation() {
        let token = Token::new(false);
        let gen_before = token.generation();
        let flag = Arc::new(AtomicBool::new(false));
        let cancellable: Arc<dyn Cancellable> = Arc::new(RecordingCancellable(flag.clone()));
        token.request_cancel_on_invalidate(Arc::downgrade(&cancellable));

        token.cancel_without_invalidating();
        assert_eq!(token.generation(), gen_before);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn invalidating_twice_does_not_crash() {
        // A token can legitimately be invalidated more than once: an
        // explicit call followed by auto-invalidate-on-drop, or two
        // explicit calls. The registries must survive being drained twice.
        let token = Token::new(true);
        let gate = token.gate();
        let flag = Arc::new(AtomicBool::new(false));
        let cancellable: Arc<dyn Cancellable> = Arc::new(RecordingCancellable(flag.clone()));
        token.request_cancel_on_invalidate(Arc::downgrade(&cancellable));

        token.invalidate();
        assert!(gate.is_invalidated());
        assert!(flag.load(Ordering::SeqCst));

        // A second explicit invalidate must not panic or crash.
        token.invalidate();
        // Dropping the last strong handle triggers auto-invalidate a third
        // time.
        drop(token);
    }

    #[test]
    fn chained_token_survives_parent_invalidated_twice() {
        let parent = Token::new(false);
        let child = Token::new(false);
        child.chain_from(&parent, true);
        let child_gate = child.gate();

        parent.invalidate();
        assert!(child_gate.is_invalidated());

        // Invalidating the parent again must not crash, even though its
        // registries were already drained once.
        parent.invalidate();
        parent.cancel_without_invalidating();
    }
}
