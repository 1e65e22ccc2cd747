//! Component D: the inter-process read/update/write lock word.
//!
//! Grounded on `shm/lock.rs`'s `ShmRwLock` — a lock object that lives inside
//! the mapped region so any process mapping the same file can contend on it.
//! The mechanism is replaced: `pthread_rwlock_t` has no update/write
//! distinction and no upgrade/downgrade path, so this hand-rolls the word
//! out of a single `AtomicU64` with CAS loops and a Linux futex wait/wake,
//! the way `shm/lock.rs` reaches for `libc` directly for OS primitives rather
//! than going through a crate like `parking_lot` for this cross-process case.
//!
//! Word layout (low to high): `readers` (24 bits) ‖ `update` (1 bit) ‖
//! `write` (1 bit) ‖ reserved (6 bits) ‖ `waiters` (32 bits). `waiters`
//! counts threads currently parked on this word; it exists purely so
//! `wake()` can skip the futex syscall when nobody is waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const READERS_MASK: u64 = 0x00FF_FFFF;
const UPDATE_BIT: u64 = 1 << 24;
const WRITE_BIT: u64 = 1 << 25;
const WAITERS_SHIFT: u32 = 32;
const WAITERS_UNIT: u64 = 1 << WAITERS_SHIFT;

/// A view over one segment header's lock word.
pub struct LockWord<'a> {
    word: &'a AtomicU64,
}

impl<'a> LockWord<'a> {
    pub fn new(word: &'a AtomicU64) -> Self {
        LockWord { word }
    }

    pub fn reader_count(&self) -> u32 {
        (self.word.load(Ordering::Acquire) & READERS_MASK) as u32
    }

    pub fn read_lock(&self, timeout: Option<Duration>) -> bool {
        self.acquire(timeout, READERS_MASK | UPDATE_BIT | WRITE_BIT, |cur| {
            if cur & WRITE_BIT == 0 {
                Some(cur + 1)
            } else {
                None
            }
        })
    }

    pub fn update_lock(&self, timeout: Option<Duration>) -> bool {
        self.acquire(timeout, READERS_MASK | UPDATE_BIT | WRITE_BIT, |cur| {
            if cur & (WRITE_BIT | UPDATE_BIT) == 0 {
                Some(cur | UPDATE_BIT)
            } else {
                None
            }
        })
    }

    pub fn write_lock(&self, timeout: Option<Duration>) -> bool {
        self.acquire(timeout, READERS_MASK | UPDATE_BIT | WRITE_BIT, |cur| {
            if cur & (WRITE_BIT | UPDATE_BIT) == 0 && cur & READERS_MASK == 0 {
                Some(cur | WRITE_BIT)
            } else {
                None
            }
        })
    }

    /// Precondition: caller already holds the update lock. Only the readers
    /// bits are eligible for the best-effort `LockTimeout` reset here — the
    /// caller's own `UPDATE_BIT` must survive a reset, or the retried
    /// transition below would trip its own precondition.
    pub fn upgrade_update_to_write(&self, timeout: Option<Duration>) -> bool {
        self.acquire(timeout, READERS_MASK, |cur| {
            debug_assert!(cur & UPDATE_BIT != 0, "upgrade_update_to_write without update held");
            if cur & READERS_MASK == 0 {
                Some((cur & !UPDATE_BIT) | WRITE_BIT)
            } else {
                None
            }
        })
    }

    pub fn downgrade_write_to_update(&self) {
        self.modify(|cur| (cur & !WRITE_BIT) | UPDATE_BIT);
        self.wake();
    }

    pub fn downgrade_update_to_read(&self) {
        self.modify(|cur| (cur & !UPDATE_BIT) + 1);
        self.wake();
    }

    pub fn downgrade_write_to_read(&self) {
        self.modify(|cur| (cur & !WRITE_BIT) + 1);
        self.wake();
    }

    pub fn read_unlock(&self) {
        self.modify(|cur| cur - 1);
        self.wake();
    }

    pub fn update_unlock(&self) {
        self.modify(|cur| cur & !UPDATE_BIT);
        self.wake();
    }

    pub fn write_unlock(&self) {
        self.modify(|cur| cur & !WRITE_BIT);
        self.wake();
    }

    fn modify(&self, f: impl Fn(u64) -> u64) -> u64 {
        loop {
            let cur = self.word.load(Ordering::Acquire);
            let new = f(cur);
            if self
                .word
                .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return new;
            }
        }
    }

    /// CAS-loop + park until `try_transition` succeeds or `timeout` elapses.
    /// `try_transition` returns the new word on success, `None` to keep
    /// waiting. A caller-supplied timeout does not simply give up: on
    /// expiry, `reset_mask` (the bits this particular transition is blocked
    /// by, never bits the caller already legitimately holds) is cleared
    /// best-effort and the transition is retried exactly once before
    /// finally reporting failure as `LockTimeout`.
    fn acquire(&self, timeout: Option<Duration>, reset_mask: u64, mut try_transition: impl FnMut(u64) -> Option<u64>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let cur = self.word.load(Ordering::Acquire);
            if let Some(new) = try_transition(cur) {
                if self
                    .word
                    .compare_exchange_weak(cur, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    log::trace!(target: "segmap::lock", "acquired word {cur:#x} -> {new:#x}");
                    return true;
                }
                continue;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return self.reset_and_retry(timeout, reset_mask, &mut try_transition);
                }
            }
            log::trace!(target: "segmap::lock", "parking on contended word {cur:#x}");
            self.word.fetch_add(WAITERS_UNIT, Ordering::AcqRel);
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            futex_wait(self.word, cur as u32, remaining);
            self.word.fetch_sub(WAITERS_UNIT, Ordering::AcqRel);
        }
    }

    /// Best-effort recovery from a timed-out acquire: clear `reset_mask`
    /// (leaving the waiters counter, and any bits outside the mask, alone —
    /// other threads may genuinely still be parked, and the caller's own
    /// already-held bits must survive) and retry `try_transition` exactly
    /// once. Returns whether that single retry succeeded.
    fn reset_and_retry(&self, timeout: Option<Duration>, reset_mask: u64, try_transition: &mut impl FnMut(u64) -> Option<u64>) -> bool {
        let nanos = timeout.map(|d| d.as_nanos() as u64).unwrap_or(0);
        log::warn!(target: "segmap::lock", "lock acquire timed out after {nanos}ns; resetting word (best-effort) and retrying once");
        let before = self.word.fetch_and(!reset_mask, Ordering::AcqRel);
        self.wake();
        let cur = before & !reset_mask;
        if let Some(new) = try_transition(cur) {
            if self.word.compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                log::debug!(target: "segmap::lock", "post-reset retry acquired word {cur:#x} -> {new:#x}");
                return true;
            }
        }
        log::warn!(target: "segmap::lock", "post-reset retry still failed to acquire");
        false
    }

    fn wake(&self) {
        if self.word.load(Ordering::Acquire) >> WAITERS_SHIFT != 0 {
            futex_wake(self.word);
        }
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU64, expected_low32: u32, timeout: Option<Duration>) {
    let addr = word.as_ptr() as *const u32;
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as i64,
    });
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const libc::timespec);
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr,
            libc::FUTEX_WAIT,
            expected_low32,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU64) {
    let addr = word.as_ptr() as *const u32;
    unsafe {
        libc::syscall(libc::SYS_futex, addr, libc::FUTEX_WAKE, i32::MAX, std::ptr::null::<u32>(), std::ptr::null::<u32>(), 0);
    }
}

/// Non-Linux targets have no portable futex syscall (macOS's is private, as
/// `shm/lock.rs`'s own `pthread_rwlock` fallback comment notes); fall back to
/// a short bounded sleep so contended callers still make progress.
#[cfg(not(target_os = "linux"))]
fn futex_wait(_word: &AtomicU64, _expected_low32: u32, timeout: Option<Duration>) {
    let nap = Duration::from_micros(50);
    std::thread::sleep(timeout.map(|d| d.min(nap)).unwrap_or(nap));
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU64) {}
