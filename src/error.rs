use thiserror::Error;

/// Invariant violations reported through [`crate::diag`]. None of these stop
/// the process; they tell the hosting diagnostic system that a caller broke
/// the reference-counting protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Violation {
    /// A strong reference was released while the strong count was already
    /// zero (or below).
    #[error("object released its strong reference too many times")]
    TooManyReleases,
    /// A strong reference was taken on a normal-lifetime object after its
    /// last strong reference had been released.
    #[error("strong reference taken after the last strong reference was released")]
    IncAfterLastRelease,
    /// The attempt-acquire side counter went negative, i.e. more forced
    /// releases than attempt acquisitions.
    #[error("attempt-acquire released more often than it was set (count {0})")]
    IllegalAttemptRelease(i32),
}

/// Reasons a weak handle could not be promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PromoteError {
    /// The weak handle does not reference anything.
    #[error("weak reference is empty")]
    Empty,
    /// The object has been released, or its promotion gate refused.
    #[error("object is gone or refused promotion")]
    Expired,
}
