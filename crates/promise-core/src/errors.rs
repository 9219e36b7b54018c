//! Error taxonomy for the promise core (spec §7 / SPEC_FULL C7).
//!
//! The core itself settles promises with a user-supplied `E`; it never
//! constructs any variant here. [`CoreError`] exists as the shared
//! vocabulary the out-of-scope external collaborators target:
//!
//! - the callback-adapter shim (converts a `(value?, error?)`-style
//!   callback into a resolver call) raises [`CoreError::ApiMismatch`] when
//!   both are absent;
//! - the timeout utility raises [`CoreError::TimedOut`] or wraps an inner
//!   rejection as [`CoreError::RejectedWithInner`].
//!
//! Neither collaborator is implemented in this crate (spec.md §1, Out of
//! scope) but downstream crates that do implement them should not need to
//! invent their own error type to interoperate with promises produced here.

/// Errors raised by collaborators built on top of the promise core.
///
/// Re-exported from the crate root so `E = promise_core::CoreError` is a
/// reasonable default error type for callers who don't have a domain error
/// of their own yet.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A callback-adapter received neither a value nor an error.
    #[error("callback invoked with neither a value nor an error")]
    ApiMismatch,

    /// An external timeout utility's timer fired before the wrapped promise
    /// settled.
    #[error("operation timed out")]
    TimedOut,

    /// An external timeout utility's timer fired, and the wrapped promise
    /// has since rejected; the inner rejection is preserved as the cause.
    #[error("operation timed out (inner promise also rejected): {inner}")]
    RejectedWithInner {
        #[source]
        inner: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_mismatch_displays() {
        assert_eq!(
            CoreError::ApiMismatch.to_string(),
            "callback invoked with neither a value nor an error"
        );
    }

    #[test]
    fn rejected_with_inner_carries_source() {
        let inner: Box<dyn std::error::Error + Send + Sync> =
            Box::new(std::io::Error::other("boom"));
        let err = CoreError::RejectedWithInner { inner };
        assert!(err.to_string().contains("boom"));
    }
}
