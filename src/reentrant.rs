//! Component E: thread-local reentrancy bookkeeping over the lock word.
//!
//! No direct teacher analogue — `toloco-warp_cache`'s `ShmRwLock` is taken
//! non-reentrantly from behind Python's GIL, so there is nothing in the pack
//! that needs per-thread upgrade/downgrade accounting. This is built
//! straight from the lock level totals table, expressed with `std::thread_local!`
//! the way a thread-confined chain is idiomatically kept in Rust (an
//! explicit `ThreadId` check stands in for "accessed from the owning
//! thread" rather than relying on `!Send`, since the context must still be
//! *creatable* ahead of the thread that will drive the scan).
//!
//! Cross-level nesting only composes soundly in the direction the lock word
//! itself supports: a context already holding UPDATE or WRITE may nest a
//! virtual READ (real `readLock` would be redundant — those levels already
//! exclude conflicting writers), and a context already holding UPDATE may
//! escalate to WRITE via `upgradeUpdateToWrite`. Nesting the other
//! direction — holding only READ and asking for UPDATE/WRITE through a
//! fresh acquire — is exactly the forbidden upgrade path and fails with
//! `IllegalUpgrade`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::thread::ThreadId;
use std::time::Duration;

use crate::error::{Error, LockLevel, Result};
use crate::lock::LockWord;

const MAX_CHAIN_DEPTH: u32 = 1 << 16;

#[derive(Default)]
struct SegmentTotals {
    read: u32,
    update: u32,
    write: u32,
}

thread_local! {
    static TOTALS: RefCell<HashMap<usize, SegmentTotals>> = RefCell::new(HashMap::new());
    static CHAIN_DEPTH: RefCell<u32> = const { RefCell::new(0) };
}

/// One context's handle onto a segment's lock word. Bound to the thread
/// that created it; using it from any other thread fails `ConcurrentAccess`.
pub struct LockContext<'a> {
    lock: LockWord<'a>,
    key: usize,
    owner: ThreadId,
    local_level: std::cell::Cell<LockLevel>,
}

impl<'a> LockContext<'a> {
    /// Pushes one level onto this thread's context chain. Fails
    /// `NestedContextExhausted` past `2^16` live contexts on this thread —
    /// almost always a missing `release`/drop somewhere upstream.
    pub fn new(lock_word: &'a AtomicU64) -> Result<Self> {
        CHAIN_DEPTH.with(|d| {
            let mut depth = d.borrow_mut();
            if *depth >= MAX_CHAIN_DEPTH {
                return Err(Error::NestedContextExhausted { max: MAX_CHAIN_DEPTH });
            }
            *depth += 1;
            Ok(())
        })?;
        Ok(LockContext {
            lock: LockWord::new(lock_word),
            key: lock_word as *const AtomicU64 as usize,
            owner: std::thread::current().id(),
            local_level: std::cell::Cell::new(LockLevel::Unlocked),
        })
    }

    pub fn local_level(&self) -> LockLevel {
        self.local_level.get()
    }

    pub(crate) fn check_owner(&self) -> Result<()> {
        if std::thread::current().id() != self.owner {
            Err(Error::ConcurrentAccess)
        } else {
            Ok(())
        }
    }

    /// Acquire `level` from `Unlocked`. Joins an existing thread-local hold
    /// on this segment without touching the shared word where the totals
    /// table says that's sound; otherwise calls into [`LockWord`] directly.
    /// Returns `Ok(false)` on timeout, never blocking past `timeout` if set.
    pub fn acquire(&self, level: LockLevel, timeout: Option<Duration>) -> Result<bool> {
        self.check_owner()?;
        if self.local_level.get() != LockLevel::Unlocked {
            debug_assert!(false, "acquire() called on an already-locked context");
            return Err(Error::ConcurrentAccess);
        }

        let acquired = TOTALS.with(|totals| -> Result<bool> {
            let mut map = totals.borrow_mut();
            let t = map.entry(self.key).or_insert_with(SegmentTotals::default);

            if t.read > 0 && t.update == 0 && t.write == 0 && level != LockLevel::Read {
                return Err(Error::IllegalUpgrade { from: LockLevel::Read, to: level });
            }

            let ok = match level {
                LockLevel::Read => {
                    if t.read + t.update + t.write == 0 && !self.lock.read_lock(timeout) {
                        false
                    } else {
                        t.read += 1;
                        true
                    }
                }
                LockLevel::Update => {
                    if t.update == 0 && t.write == 0 && !self.lock.update_lock(timeout) {
                        false
                    } else {
                        t.update += 1;
                        true
                    }
                }
                LockLevel::Write => {
                    if t.write == 0 {
                        let got = if t.update > 0 {
                            self.lock.upgrade_update_to_write(timeout)
                        } else {
                            self.lock.write_lock(timeout)
                        };
                        if !got {
                            false
                        } else {
                            t.write += 1;
                            true
                        }
                    } else {
                        t.write += 1;
                        true
                    }
                }
                LockLevel::Unlocked => true,
            };
            if !ok && t.read == 0 && t.update == 0 && t.write == 0 {
                map.remove(&self.key);
            }
            Ok(ok)
        })?;

        if acquired {
            self.local_level.set(level);
        }
        Ok(acquired)
    }

    /// Escalate UPDATE -> WRITE on this same context (the only direct
    /// upgrade D supports). Precondition: `local_level() == Update`.
    pub fn escalate_to_write(&self, timeout: Option<Duration>) -> Result<bool> {
        self.check_owner()?;
        debug_assert_eq!(self.local_level.get(), LockLevel::Update);
        let ok = TOTALS.with(|totals| -> Result<bool> {
            let mut map = totals.borrow_mut();
            let t = map.get_mut(&self.key).ok_or(Error::LockUnderflow { level: LockLevel::Update })?;
            if t.write == 0 {
                let got = if t.update > 0 {
                    self.lock.upgrade_update_to_write(timeout)
                } else {
                    self.lock.write_lock(timeout)
                };
                if !got {
                    return Ok(false);
                }
            }
            t.write += 1;
            Ok(true)
        })?;
        if ok {
            self.local_level.set(LockLevel::Write);
        }
        Ok(ok)
    }

    /// De-escalate WRITE back down to UPDATE. Precondition:
    /// `local_level() == Write`.
    pub fn de_escalate_to_update(&self) -> Result<()> {
        self.check_owner()?;
        debug_assert_eq!(self.local_level.get(), LockLevel::Write);
        TOTALS.with(|totals| -> Result<()> {
            let mut map = totals.borrow_mut();
            let t = map.get_mut(&self.key).ok_or(Error::LockUnderflow { level: LockLevel::Write })?;
            if t.write == 0 {
                return Err(Error::LockUnderflow { level: LockLevel::Write });
            }
            t.write -= 1;
            if t.write == 0 {
                if t.update > 0 {
                    self.lock.downgrade_write_to_update();
                } else if t.read > 0 {
                    self.lock.downgrade_write_to_read();
                } else {
                    self.lock.write_unlock();
                }
            }
            Ok(())
        })?;
        self.local_level.set(LockLevel::Update);
        Ok(())
    }

    /// Fully releases whatever level this context currently holds, down to
    /// `Unlocked`, following the lock-level release table all the way through
    /// (a context that escalated to WRITE and never downgraded releases
    /// from WRITE directly; see DESIGN.md).
    pub fn release(&self) -> Result<()> {
        self.check_owner()?;
        let level = self.local_level.get();
        if level == LockLevel::Unlocked {
            return Ok(());
        }
        TOTALS.with(|totals| -> Result<()> {
            let mut map = totals.borrow_mut();
            let t = map.get_mut(&self.key).ok_or(Error::LockUnderflow { level })?;
            match level {
                LockLevel::Read => {
                    if t.read == 0 {
                        return Err(Error::LockUnderflow { level });
                    }
                    t.read -= 1;
                    if t.read == 0 && t.update == 0 && t.write == 0 {
                        self.lock.read_unlock();
                    }
                }
                LockLevel::Update => {
                    if t.update == 0 {
                        return Err(Error::LockUnderflow { level });
                    }
                    t.update -= 1;
                    if t.update == 0 {
                        if t.write > 0 {
                            // no-op: write still held, dominates update.
                        } else if t.read > 0 {
                            self.lock.downgrade_update_to_read();
                        } else {
                            self.lock.update_unlock();
                        }
                    }
                }
                LockLevel::Write => {
                    if t.write == 0 {
                        return Err(Error::LockUnderflow { level });
                    }
                    t.write -= 1;
                    if t.write == 0 {
                        if t.update > 0 {
                            self.lock.downgrade_write_to_update();
                        } else if t.read > 0 {
                            self.lock.downgrade_write_to_read();
                        } else {
                            self.lock.write_unlock();
                        }
                    }
                }
                LockLevel::Unlocked => unreachable!(),
            }
            if t.read == 0 && t.update == 0 && t.write == 0 {
                map.remove(&self.key);
            }
            Ok(())
        })?;
        self.local_level.set(LockLevel::Unlocked);
        Ok(())
    }
}

impl Drop for LockContext<'_> {
    fn drop(&mut self) {
        if self.local_level.get() != LockLevel::Unlocked {
            let _ = self.release();
        }
        CHAIN_DEPTH.with(|d| {
            let mut depth = d.borrow_mut();
            *depth = depth.saturating_sub(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn nested_same_level_contexts_share_one_real_lock() {
        let w = AtomicU64::new(0);
        let a = LockContext::new(&w).unwrap();
        assert!(a.acquire(LockLevel::Read, None).unwrap());
        let b = LockContext::new(&w).unwrap();
        assert!(b.acquire(LockLevel::Read, None).unwrap());
        assert_eq!(LockWord::new(&w).reader_count(), 1, "second nested read must not call the real lock again");
        b.release().unwrap();
        assert_eq!(LockWord::new(&w).reader_count(), 1);
        a.release().unwrap();
        assert_eq!(LockWord::new(&w).reader_count(), 0);
    }

    #[test]
    fn read_then_update_is_illegal_upgrade() {
        let w = AtomicU64::new(0);
        let a = LockContext::new(&w).unwrap();
        assert!(a.acquire(LockLevel::Read, None).unwrap());
        let b = LockContext::new(&w).unwrap();
        let err = b.acquire(LockLevel::Update, None).unwrap_err();
        assert!(matches!(err, Error::IllegalUpgrade { from: LockLevel::Read, to: LockLevel::Update }));
    }

    #[test]
    fn escalate_then_deescalate_round_trips() {
        let w = AtomicU64::new(0);
        let ctx = LockContext::new(&w).unwrap();
        assert!(ctx.acquire(LockLevel::Update, None).unwrap());
        assert!(ctx.escalate_to_write(None).unwrap());
        assert_eq!(ctx.local_level(), LockLevel::Write);
        ctx.de_escalate_to_update().unwrap();
        assert_eq!(ctx.local_level(), LockLevel::Update);
        ctx.release().unwrap();
        assert_eq!(ctx.local_level(), LockLevel::Unlocked);
    }

    #[test]
    fn nested_read_under_write_joins_virtually_then_promotes_on_release() {
        let w = AtomicU64::new(0);
        let writer = LockContext::new(&w).unwrap();
        assert!(writer.acquire(LockLevel::Write, None).unwrap());
        let reader = LockContext::new(&w).unwrap();
        assert!(reader.acquire(LockLevel::Read, None).unwrap());
        assert_eq!(LockWord::new(&w).reader_count(), 0, "nested read under write makes no real reader call yet");
        writer.release().unwrap();
        assert_eq!(LockWord::new(&w).reader_count(), 1, "releasing write while a nested read outlives it promotes to a real reader");
        reader.release().unwrap();
        assert_eq!(LockWord::new(&w).reader_count(), 0);
    }

    #[test]
    fn foreign_thread_access_is_rejected() {
        let w = AtomicU64::new(0);
        let ctx = LockContext::new(&w).unwrap();
        ctx.acquire(LockLevel::Read, None).unwrap();
        let ctx_addr = &ctx as *const LockContext as usize;
        std::thread::scope(|scope| {
            scope.spawn(move || {
                let ctx_ref = unsafe { &*(ctx_addr as *const LockContext) };
                assert!(matches!(ctx_ref.acquire(LockLevel::Read, None), Err(Error::ConcurrentAccess)));
            });
        });
    }
}
