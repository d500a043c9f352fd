//! Lock-free atomic fd lifecycle and refcount, so one thread can safely
//! unblock another thread parked in a blocking syscall on the same fd.
//!
//! Single `AtomicU64` word, CAS-only mutation — no lock, all state packed
//! into one word.
//!
//! ```text
//!           Set           Disable
//! [empty] ──────▶ [open] ────────▶ [open,disabled]
//!   │   ▲          │                     │ Close
//!   │   │   Close  │                     ▼
//!   │   └──────────┤                [disabled]
//!   │              │ Disable
//!   └──────────────┴──────▶ [disabled]
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{check_syscall, NetError, NetResult};

const FD_BITS: u32 = 48;
const FD_MASK: u64 = (1u64 << FD_BITS) - 1;
const REFCOUNT_SHIFT: u32 = FD_BITS;
const REFCOUNT_BITS: u32 = 12;
const REFCOUNT_MAX: u64 = (1u64 << REFCOUNT_BITS) - 1;
const REFCOUNT_MASK: u64 = REFCOUNT_MAX << REFCOUNT_SHIFT;
const OPEN_BIT: u64 = 1 << (REFCOUNT_SHIFT + REFCOUNT_BITS);
const DISABLED_BIT: u64 = OPEN_BIT << 1;

#[inline]
fn fd_of(word: u64) -> i32 {
    (word & FD_MASK) as i32
}

#[inline]
fn refcount_of(word: u64) -> u32 {
    ((word & REFCOUNT_MASK) >> REFCOUNT_SHIFT) as u32
}

#[inline]
fn is_open(word: u64) -> bool {
    word & OPEN_BIT != 0
}

#[inline]
fn is_disabled(word: u64) -> bool {
    word & DISABLED_BIT != 0
}

#[inline]
fn pack(fd: i32, refcount: u32, open: bool, disabled: bool) -> u64 {
    debug_assert!(refcount as u64 <= REFCOUNT_MAX);
    ((fd as u64) & FD_MASK)
        | ((refcount as u64) << REFCOUNT_SHIFT)
        | if open { OPEN_BIT } else { 0 }
        | if disabled { DISABLED_BIT } else { 0 }
}

/// Snapshot returned by [`ManagedFd::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseState {
    pub open: bool,
    pub disabled: bool,
    pub refcount: u32,
}

/// One atomically-managed kernel file descriptor.
#[derive(Debug)]
pub struct ManagedFd {
    word: AtomicU64,
}

impl Default for ManagedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedFd {
    pub const fn new() -> Self {
        Self { word: AtomicU64::new(0) }
    }

    fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Retry a CAS loop until it succeeds or the guard rejects the current
    /// state. `transform` computes the next word from the current one;
    /// return `None` from `transform` to signal a precondition failure.
    fn cas_loop(
        &self,
        mut transform: impl FnMut(u64) -> Option<u64>,
    ) -> Option<(u64, u64)> {
        let mut current = self.load();
        loop {
            let next = transform(current)?;
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some((current, next)),
                Err(actual) => current = actual,
            }
        }
    }

    /// `Set`: only from `empty` (not open, not disabled). Stores `fd`,
    /// transitions to `open`, preserves any existing refcount.
    pub fn set(&self, fd: i32) -> NetResult<()> {
        let result = self.cas_loop(|cur| {
            if is_open(cur) || is_disabled(cur) {
                None
            } else {
                Some(pack(fd, refcount_of(cur), true, false))
            }
        });
        result
            .map(|_| ())
            .ok_or_else(|| NetError::lifecycle("set: fd already initialised or disabled"))
    }

    /// Moves `other`'s state into `self`; `self` must be empty. Both words
    /// are updated via independent CAS loops with a retry if the two
    /// interleave (another thread's `set`/`close`/`disable` on either side
    /// between our reads).
    pub fn from(&self, other: &ManagedFd) -> NetResult<()> {
        loop {
            let other_word = other.load();
            if !is_open(other_word) && !is_disabled(other_word) {
                return Err(NetError::lifecycle("from: source fd is empty"));
            }
            let self_word = self.load();
            if is_open(self_word) || is_disabled(self_word) {
                return Err(NetError::lifecycle("from: destination fd is not empty"));
            }

            let emptied = pack(0, refcount_of(other_word), false, false);
            if other
                .word
                .compare_exchange(other_word, emptied, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let taken = pack(
                fd_of(other_word),
                refcount_of(other_word),
                is_open(other_word),
                is_disabled(other_word),
            );
            match self
                .word
                .compare_exchange(self_word, taken, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(_) => {
                    // Someone else touched `self` between our read and our
                    // CAS attempt; undo the steal from `other` and retry
                    // the whole transfer from scratch.
                    other.word.store(other_word, Ordering::Release);
                    continue;
                }
            }
        }
    }

    /// `Close`: precondition `open`. Closes the kernel fd exactly once,
    /// clears `open`, preserves `disabled` and refcount.
    pub fn close(&self) -> NetResult<()> {
        let transition = self.cas_loop(|cur| {
            if !is_open(cur) {
                None
            } else {
                Some(pack(0, refcount_of(cur), false, is_disabled(cur)))
            }
        });
        let (prev, _) = transition.ok_or_else(|| NetError::lifecycle("close: fd not open"))?;
        let fd = fd_of(prev);
        check_syscall("close", unsafe { libc::close(fd) })?;
        Ok(())
    }

    /// `Eject`: precondition `open`. Returns the fd without closing it —
    /// the caller now owns the kernel descriptor.
    pub fn eject(&self) -> NetResult<i32> {
        let transition = self.cas_loop(|cur| {
            if !is_open(cur) {
                None
            } else {
                Some(pack(0, refcount_of(cur), false, is_disabled(cur)))
            }
        });
        let (prev, _) = transition.ok_or_else(|| NetError::lifecycle("eject: fd not open"))?;
        Ok(fd_of(prev))
    }

    /// `Disable`: precondition "not already disabled". Sets `disabled`; if
    /// the fd was open, issues `shutdown(SHUT_RDWR)` to unstick any thread
    /// blocked in a syscall on this fd. Returns whether a shutdown was
    /// actually issued.
    pub fn disable(&self) -> NetResult<bool> {
        let transition = self.cas_loop(|cur| {
            if is_disabled(cur) {
                None
            } else {
                Some(cur | DISABLED_BIT)
            }
        });
        let (prev, _) = transition.ok_or_else(|| NetError::lifecycle("disable: already disabled"))?;
        if is_open(prev) {
            let fd = fd_of(prev);
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// `shutdown(SHUT_RD)`. Precondition: open.
    pub fn shutdown_read(&self) -> NetResult<()> {
        let word = self.load();
        if !is_open(word) {
            return Err(NetError::lifecycle("shutdown_read: fd not open"));
        }
        check_syscall("shutdown", unsafe { libc::shutdown(fd_of(word), libc::SHUT_RD) })?;
        Ok(())
    }

    /// Precondition: open and not disabled. Increments the refcount and
    /// returns the fd. Panics on refcount overflow past the 12-bit field —
    /// an unrecoverable programming error (far more acquires than any
    /// reasonable caller count outstanding at once).
    pub fn acquire(&self) -> NetResult<i32> {
        let transition = self.cas_loop(|cur| {
            if !is_open(cur) || is_disabled(cur) {
                return None;
            }
            let rc = refcount_of(cur);
            assert!(rc < REFCOUNT_MAX as u32, "ManagedFd refcount overflow");
            Some(pack(fd_of(cur), rc + 1, true, false))
        });
        let (prev, _) = transition.ok_or_else(|| NetError::lifecycle("acquire: fd not usable"))?;
        Ok(fd_of(prev))
    }

    /// Precondition: refcount > 0. Decrements the refcount and returns the
    /// resulting `{open, disabled, count}` snapshot.
    pub fn release(&self) -> NetResult<ReleaseState> {
        let transition = self.cas_loop(|cur| {
            let rc = refcount_of(cur);
            if rc == 0 {
                return None;
            }
            Some(pack(fd_of(cur), rc - 1, is_open(cur), is_disabled(cur)))
        });
        let (_, next) =
            transition.ok_or_else(|| NetError::lifecycle("release: refcount already zero"))?;
        Ok(ReleaseState {
            open: is_open(next),
            disabled: is_disabled(next),
            refcount: refcount_of(next),
        })
    }

    /// Release one reference, disable if not already disabled, and close
    /// the kernel fd if the fd was open and the refcount just reached
    /// zero. Idempotent from any reachable state.
    pub fn release_and_disable_and_maybe_close(&self) -> NetResult<()> {
        let was_open_before_release = self.is_open();
        let state = self.release()?;
        if !state.disabled {
            self.disable()?;
        }
        if was_open_before_release && state.refcount == 0 && state.open {
            self.close()?;
        }
        Ok(())
    }

    // --- read-only queries: single atomic loads ---------------------------

    pub fn is_open(&self) -> bool {
        is_open(self.load())
    }

    pub fn is_disabled(&self) -> bool {
        is_disabled(self.load())
    }

    pub fn is_empty(&self) -> bool {
        let w = self.load();
        !is_open(w) && !is_disabled(w)
    }

    pub fn refcount(&self) -> u32 {
        refcount_of(self.load())
    }

    /// Raw fd value, regardless of open/disabled state. Returns `None` if
    /// the managed slot has never held a descriptor (fd value 0 with no
    /// open/disabled bits means "never set"; fd 0 itself is stdin and is
    /// never produced by `socket(2)` for the sockets this crate manages).
    pub fn raw_fd(&self) -> Option<i32> {
        let w = self.load();
        if !is_open(w) && !is_disabled(w) {
            None
        } else {
            Some(fd_of(w))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pipe_fds() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn set_then_close_closes_exactly_once() {
        let (r, _w) = pipe_fds();
        let mfd = ManagedFd::new();
        mfd.set(r).unwrap();
        assert!(mfd.is_open());
        mfd.close().unwrap();
        assert!(!mfd.is_open());
        assert!(mfd.close().is_err(), "second close must fail, not double-close");
    }

    #[test]
    fn set_requires_empty() {
        let (r, _w) = pipe_fds();
        let mfd = ManagedFd::new();
        mfd.set(r).unwrap();
        assert!(mfd.set(r).is_err());
    }

    #[test]
    fn disable_on_open_issues_shutdown_and_marks_disabled() {
        // shutdown(2) on a pipe fd fails (ENOTSOCK) but disable() only
        // cares that it issued the call, not that the kernel accepted it.
        let (r, _w) = pipe_fds();
        let mfd = ManagedFd::new();
        mfd.set(r).unwrap();
        let issued = mfd.disable().unwrap();
        assert!(issued);
        assert!(mfd.is_disabled());
        assert!(mfd.is_open(), "disable must not clear open by itself");
        unsafe { libc::close(r) };
    }

    #[test]
    fn disable_twice_errors() {
        let (r, _w) = pipe_fds();
        let mfd = ManagedFd::new();
        mfd.set(r).unwrap();
        mfd.disable().unwrap();
        assert!(mfd.disable().is_err());
        unsafe { libc::close(r) };
    }

    #[test]
    fn eject_transfers_ownership_without_closing() {
        let (r, _w) = pipe_fds();
        let mfd = ManagedFd::new();
        mfd.set(r).unwrap();
        let fd = mfd.eject().unwrap();
        assert_eq!(fd, r);
        assert!(mfd.is_empty());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn acquire_release_refcounting() {
        let (r, _w) = pipe_fds();
        let mfd = ManagedFd::new();
        mfd.set(r).unwrap();
        mfd.acquire().unwrap();
        mfd.acquire().unwrap();
        assert_eq!(mfd.refcount(), 2);
        let s1 = mfd.release().unwrap();
        assert_eq!(s1.refcount, 1);
        let s2 = mfd.release().unwrap();
        assert_eq!(s2.refcount, 0);
        assert!(mfd.release().is_err());
        mfd.close().unwrap();
    }

    #[test]
    fn acquire_fails_once_disabled() {
        let (r, _w) = pipe_fds();
        let mfd = ManagedFd::new();
        mfd.set(r).unwrap();
        mfd.disable().unwrap();
        assert!(mfd.acquire().is_err());
        unsafe { libc::close(r) };
    }

    #[test]
    fn from_transfers_state_and_empties_source() {
        let (r, _w) = pipe_fds();
        let a = ManagedFd::new();
        let b = ManagedFd::new();
        a.set(r).unwrap();
        b.from(&a).unwrap();
        assert!(a.is_empty());
        assert!(b.is_open());
        assert_eq!(b.raw_fd(), Some(r));
        b.close().unwrap();
        assert!(b.close().is_err());
    }

    #[test]
    fn concurrent_acquire_release_never_goes_negative() {
        let (r, _w) = pipe_fds();
        let mfd = Arc::new(ManagedFd::new());
        mfd.set(r).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mfd = mfd.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if mfd.acquire().is_ok() {
                        let _ = mfd.release();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mfd.refcount(), 0);
        mfd.close().unwrap();
    }
}
