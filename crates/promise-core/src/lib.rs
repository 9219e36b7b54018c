//! promise-core: a concurrency primitive for cancellable, cross-thread
//! promises with invalidation tokens and pluggable execution contexts.
//!
//! This crate has no notion of I/O, timers, or a particular async runtime
//! beyond what [`tokio::sync::oneshot`] needs for [`promise::Promise::result`];
//! everything else is built on atomics and a lock-free intrusive list.
//!
//! # Crate Organization
//!
//! - `list` — the intrusive lock-free stack every callback/cancel-request
//!   list in the crate is built on
//! - `cell` — the promise state machine (`State`, `Outcome`, `Cell`)
//! - `context` — execution contexts (`Main`, `Priority`, `Queue`,
//!   `TaskQueue`, `Immediate`, `NowOr`), the coalescing main-loop
//!   dispatcher, and a `tokio`-backed `Queue`/`TaskQueue` adapter under
//!   `context::adapters`
//! - `token` — invalidation tokens: generation counters, cancellable
//!   lists, and chaining
//! - `promise` — the public `Promise`/`Resolver` handle types
//! - `combinators` — the `map`/`flat_map`/`recover`/... combinator table
//! - `errors` — `CoreError`, the shared vocabulary for collaborators built
//!   on top of this crate
//! - `testing` — deterministic fakes for execution contexts (`ManualQueue`,
//!   `RecordingContext`, `simulated_main_loop`), for use in this crate's own
//!   tests and downstream crates' tests alike

pub mod cell;
pub mod combinators;
pub mod context;
pub mod errors;
pub mod list;
pub mod promise;
pub mod testing;
pub mod token;

pub use cell::Outcome;
pub use context::{Context, Priority, Queue, TaskQueue};
pub use errors::CoreError;
pub use promise::{delayed, promise_on, promise_with_resolver, Promise, Resolver};
pub use token::{Cancellable, Token, TokenGate};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_compiles() {
        let p: Promise<i32, String> = Promise::fulfilled(1);
        assert_eq!(p.result_sync(), Some(Outcome::Value(1)));
    }
}
