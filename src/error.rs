//! Error kinds for the segment map, per the error handling design.
//!
//! `LockUnderflow` and `NestedContextExhausted` are fatal protocol
//! violations: callers are expected to log and abort rather than retry, but
//! they are still ordinary [`Error`] values (never a bare `panic!`) so the
//! decision to abort stays with the caller.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bitset allocator could not find `n` contiguous free chunks.
    #[error("segment full: no run of {requested} contiguous chunks available")]
    SegmentFull { requested: u32 },

    /// `n > maxChunksPerEntry`.
    #[error("entry too large: {requested} chunks exceeds the {max} chunk limit")]
    EntryTooLarge { requested: u32, max: u32 },

    /// A read lock attempted to escalate directly to update or write.
    #[error("illegal upgrade: cannot escalate from {from:?} to {to:?} while holding READ")]
    IllegalUpgrade { from: LockLevel, to: LockLevel },

    /// A release was attempted when the corresponding total was already zero.
    /// Fatal: the thread-local bookkeeping has diverged from reality.
    #[error("lock underflow releasing {level:?}: total already zero")]
    LockUnderflow { level: LockLevel },

    /// The configured `lockTimeOutNanos` elapsed while waiting for a level.
    #[error("timed out after {nanos}ns waiting for {level:?}")]
    LockTimeout { level: LockLevel, nanos: u64 },

    /// A context was used from a thread other than the one that created it,
    /// or a second context tried to independently own a segment's lock that
    /// another context on this thread already owns (nested-context-on-same-
    /// segment is folded into this kind).
    #[error("concurrent access: context used from a non-owning thread or context")]
    ConcurrentAccess,

    /// A view was used after `remove()` was called on it during the same
    /// iteration step.
    #[error("stale entry access: entry was removed earlier in this iteration")]
    StaleEntryAccess,

    /// The thread-local context chain exceeded its maximum depth (2^16).
    /// Fatal: strongly suggests a missing `close()`.
    #[error("nested context chain exhausted: depth exceeded {max}")]
    NestedContextExhausted { max: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Thread-local lock level, ordered READ < UPDATE < WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    Unlocked,
    Read,
    Update,
    Write,
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
