//! Internal error type.
//!
//! The three public entry points (`init`, `lazy_copy`, `reset`) never
//! return a [`Result`] — per the design's error-handling policy, anomalies
//! that are this crate's responsibility are absorbed internally, and
//! anomalies that are the caller's fault surface as the process's normal
//! fault-termination behavior. This type exists for the internal plumbing
//! between components, mirrored on the teacher's own `KernelError`: one
//! variant per failure mode, each documented with the condition it
//! represents.
use std::fmt;

/// A failure internal to the lazy-copy machinery.
#[derive(Debug)]
pub enum LazyCopyError {
    /// A page-fault address did not belong to any pending record.
    ///
    /// This is a genuine bug in the user program (an access to memory this
    /// crate never protected and was never asked to manage). The fault
    /// handler does not construct this as a `Result` — it is documented
    /// here because it is a named failure mode of the design — it instead
    /// writes a diagnostic and terminates the process directly, since a
    /// signal handler cannot safely propagate a `Result` anywhere.
    UnmanagedFault,

    /// `mprotect` or `sysconf` returned an OS-level error.
    ///
    /// Treated as a programming bug in the caller's address arguments
    /// (an unmapped or misaligned `src`/`dst`). Carries the underlying
    /// [`std::io::Error`] for diagnostics.
    ProtectionCallFailure(std::io::Error),

    /// A `debug_assert!`-guarded internal consistency check failed.
    ///
    /// Only reachable in debug builds; in release builds the condition is
    /// assumed to hold by construction.
    Invariant(&'static str),
}

impl fmt::Display for LazyCopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LazyCopyError::UnmanagedFault => write!(f, "fault address is not covered by any pending copy"),
            LazyCopyError::ProtectionCallFailure(e) => write!(f, "page protection call failed: {e}"),
            LazyCopyError::Invariant(what) => write!(f, "internal invariant violated: {what}"),
        }
    }
}

impl std::error::Error for LazyCopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LazyCopyError::ProtectionCallFailure(e) => Some(e),
            _ => None,
        }
    }
}
