use std::error::Error as StdError;
use std::fmt;

/// Errors returned by the connection pool registry.
///
/// All variants propagate straight to the caller; the registry never
/// retries on its own. Invariant violations that indicate caller misuse
/// (e.g. removing an in-use node) are not represented here — they abort
/// via `assert!` instead, per the fatal-invariant policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The endpoint could not be parsed (malformed IPv4 dotted-quad).
    InvalidInput,
    /// Allocation failed while constructing a pool or node.
    ///
    /// Unreachable in practice: Rust's global allocator aborts the process
    /// on allocation failure rather than returning control here. Retained
    /// for API fidelity with the source registry's error surface.
    OutOfMemory,
    /// No pool exists for this endpoint, or the pool has no nodes.
    NotFound,
    /// The node is currently locked by another caller.
    Busy,
    /// The pool has nodes, but none of them are acquirable (`READY`).
    AllPathsDown,
    /// `timed_get`'s wait budget expired before a node became available.
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidInput => "malformed endpoint",
            Error::OutOfMemory => "allocation failed",
            Error::NotFound => "no pool for endpoint",
            Error::Busy => "node is currently locked",
            Error::AllPathsDown => "pool has nodes but none are ready",
            Error::Timeout => "timed out waiting for an idle connection",
        })
    }
}

impl StdError for Error {}
