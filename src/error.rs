//! The status/error contract shared by [`crate::ms`] and [`crate::poll`].
//!
//! Every fallible operation in this crate returns a [`Status`] rather than
//! panicking or using `Option` to paper over a real failure. `Status` is
//! deliberately flat (no nested cause chain beyond the one `Os` variant) so
//! that callers can match on it the same way the original status-code
//! contract intended.

use std::fmt;
use std::io;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Status>;

/// The external status contract.
///
/// `Success` is never constructed as an error value; operations that
/// "return status" in the spec return `Result<T, Status>` here instead, with
/// `Ok` standing in for `Success`. The remaining variants are the non-success
/// codes a caller needs to branch on.
#[derive(Debug)]
#[non_exhaustive]
pub enum Status {
    /// Allocation, or kernel event-source association, failed for capacity
    /// reasons.
    NoMem,
    /// The operation isn't provided by this memory system, or threading
    /// support was requested where it isn't available.
    NotImplemented,
    /// `unregister`/`unregister_type` found nothing matching.
    InvalidArgument,
    /// The kernel didn't know the descriptor being removed.
    NotFound,
    /// `poll` returned with no events before the timeout elapsed.
    TimedUp,
    /// `poll` returned because of a `wakeup`. Routine, not an error.
    Interrupted,
    /// `wakeup` was called on a poll set that wasn't created wakeable.
    NotWakeable,
    /// A directory argument was required but missing. Reserved for
    /// out-of-scope directory-enumeration collaborators; see `SPEC_FULL.md`.
    NoDirectory,
    /// A context argument was required but missing. Reserved, as above.
    NoContext,
    /// An error surfaced from the host kernel (`port_create`, `port_getn`,
    /// pipe setup, ...).
    Os(io::Error),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoMem => write!(f, "allocation or association failed (no memory)"),
            Status::NotImplemented => write!(f, "operation not implemented by this backend"),
            Status::InvalidArgument => write!(f, "no matching entry"),
            Status::NotFound => write!(f, "descriptor not found"),
            Status::TimedUp => write!(f, "timed out waiting for events"),
            Status::Interrupted => write!(f, "interrupted by wakeup"),
            Status::NotWakeable => write!(f, "poll set is not wakeable"),
            Status::NoDirectory => write!(f, "missing directory argument"),
            Status::NoContext => write!(f, "missing context argument"),
            Status::Os(e) => write!(f, "system error: {e}"),
        }
    }
}

impl std::error::Error for Status {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Status::Os(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Self {
        Status::Os(e)
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        use Status::*;
        matches!(
            (self, other),
            (NoMem, NoMem)
                | (NotImplemented, NotImplemented)
                | (InvalidArgument, InvalidArgument)
                | (NotFound, NotFound)
                | (TimedUp, TimedUp)
                | (Interrupted, Interrupted)
                | (NotWakeable, NotWakeable)
                | (NoDirectory, NoDirectory)
                | (NoContext, NoContext)
        )
    }
}
