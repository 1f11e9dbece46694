//! Process-shared synchronization primitives.
//!
//! One `SharedLock`/`SharedCondVar` interface with two implementations,
//! selected by a capability flag fixed at segment creation: native
//! process-shared pthread primitives, or a CAS spin+sleep emulation for
//! platforms where shared futexes are unavailable. Both structs live
//! inside the shared segment and are initialized in place by the segment
//! creator.
//!
//! Every wait takes an absolute [`Timestamp`] deadline, never a duration:
//! the database clock can jump in simulation/playback mode, so waits are
//! chunked and re-check the clock on every wakeup.

use crate::error::{DbError, DbResult};
use crate::time::Timestamp;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// How the segment's locks are implemented. Stored in the segment header
/// so every attaching process agrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockMode {
    /// `PTHREAD_PROCESS_SHARED` mutex/condvar.
    Native = 0,
    /// CAS mutex plus sequence-counter condvar with sleep-poll waits.
    Emulated = 1,
}

impl LockMode {
    pub fn from_raw(raw: u32) -> DbResult<LockMode> {
        match raw {
            0 => Ok(LockMode::Native),
            1 => Ok(LockMode::Emulated),
            other => Err(DbError::Corrupt(format!("unknown lock mode {other}"))),
        }
    }
}

/// Spin iterations before the emulated mutex falls back to sleeping.
const MUTEX_SPIN: u32 = 200;
/// Sleep slice for the emulated mutex once spinning gives up.
const MUTEX_NAP: Duration = Duration::from_micros(50);
/// Poll slice for the emulated condvar.
const COND_POLL: Duration = Duration::from_micros(200);
/// Longest single chunk a native timedwait blocks for; the clock is
/// re-read between chunks so simulated-time jumps are noticed.
const WAIT_CHUNK: Duration = Duration::from_millis(100);

/// A mutex living in shared memory.
#[repr(C)]
pub struct SharedLock {
    mode: AtomicU32,
    word: AtomicU32,
    native: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedLock {}
unsafe impl Sync for SharedLock {}

/// RAII guard; unlocks on drop.
pub struct LockGuard<'a> {
    lock: &'a SharedLock,
}

impl SharedLock {
    /// Initialize in place. Must be called exactly once, by the segment
    /// creator, before any other process can observe the lock.
    ///
    /// # Safety
    /// `self` must point at zeroed, otherwise-unshared segment memory.
    pub unsafe fn init(&self, mode: LockMode) -> DbResult<()> {
        self.mode.store(mode as u32, Ordering::Relaxed);
        self.word.store(0, Ordering::Relaxed);
        if mode == LockMode::Native {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            if libc::pthread_mutexattr_init(&mut attr) != 0 {
                return Err(DbError::Internal("pthread_mutexattr_init failed".into()));
            }
            if libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(DbError::Internal("mutexattr setpshared failed".into()));
            }
            let rc = libc::pthread_mutex_init(self.native.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(DbError::Internal("pthread_mutex_init failed".into()));
            }
        }
        Ok(())
    }

    fn mode(&self) -> LockMode {
        if self.mode.load(Ordering::Relaxed) == LockMode::Native as u32 {
            LockMode::Native
        } else {
            LockMode::Emulated
        }
    }

    pub fn lock(&self) -> LockGuard<'_> {
        match self.mode() {
            LockMode::Native => {
                // EDEADLK/EINVAL here mean the segment is unusable; there
                // is no local repair, matching the fatal-init contract.
                let rc = unsafe { libc::pthread_mutex_lock(self.native.get()) };
                assert_eq!(rc, 0, "pthread_mutex_lock failed: {rc}");
            }
            LockMode::Emulated => {
                let mut spins = 0u32;
                loop {
                    if self
                        .word
                        .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        break;
                    }
                    spins += 1;
                    if spins < MUTEX_SPIN {
                        std::hint::spin_loop();
                    } else {
                        std::thread::sleep(MUTEX_NAP);
                    }
                }
            }
        }
        LockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let ok = match self.mode() {
            LockMode::Native => unsafe { libc::pthread_mutex_trylock(self.native.get()) == 0 },
            LockMode::Emulated => self
                .word
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
        };
        ok.then_some(LockGuard { lock: self })
    }

    fn unlock_raw(&self) {
        match self.mode() {
            LockMode::Native => {
                let rc = unsafe { libc::pthread_mutex_unlock(self.native.get()) };
                debug_assert_eq!(rc, 0);
            }
            LockMode::Emulated => self.word.store(0, Ordering::Release),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_raw();
    }
}

/// A condition variable living in shared memory, paired with a
/// [`SharedLock`] by the caller.
#[repr(C)]
pub struct SharedCondVar {
    mode: AtomicU32,
    seq: AtomicU32,
    native: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for SharedCondVar {}
unsafe impl Sync for SharedCondVar {}

impl SharedCondVar {
    /// Initialize in place; same contract as [`SharedLock::init`].
    ///
    /// # Safety
    /// `self` must point at zeroed, otherwise-unshared segment memory.
    pub unsafe fn init(&self, mode: LockMode) -> DbResult<()> {
        self.mode.store(mode as u32, Ordering::Relaxed);
        self.seq.store(0, Ordering::Relaxed);
        if mode == LockMode::Native {
            let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
            if libc::pthread_condattr_init(&mut attr) != 0 {
                return Err(DbError::Internal("pthread_condattr_init failed".into()));
            }
            if libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
                libc::pthread_condattr_destroy(&mut attr);
                return Err(DbError::Internal("condattr setpshared failed".into()));
            }
            let rc = libc::pthread_cond_init(self.native.get(), &attr);
            libc::pthread_condattr_destroy(&mut attr);
            if rc != 0 {
                return Err(DbError::Internal("pthread_cond_init failed".into()));
            }
        }
        Ok(())
    }

    fn mode(&self) -> LockMode {
        if self.mode.load(Ordering::Relaxed) == LockMode::Native as u32 {
            LockMode::Native
        } else {
            LockMode::Emulated
        }
    }

    /// Wake one waiter. Callers signal while holding the paired lock so a
    /// concurrent prepare/check/wait cannot miss the wakeup.
    pub fn signal(&self) {
        match self.mode() {
            LockMode::Native => unsafe {
                libc::pthread_cond_signal(self.native.get());
            },
            LockMode::Emulated => {
                self.seq.fetch_add(1, Ordering::Release);
            }
        }
    }

    /// Wake all waiters.
    pub fn broadcast(&self) {
        match self.mode() {
            LockMode::Native => unsafe {
                libc::pthread_cond_broadcast(self.native.get());
            },
            LockMode::Emulated => {
                self.seq.fetch_add(1, Ordering::Release);
            }
        }
    }

    /// Block until signaled or until `now()` reaches `deadline`.
    ///
    /// The guard's lock is released while blocked and re-held on return.
    /// Spurious wakeups are allowed; callers loop on their predicate.
    /// `now` is the database clock, which may be simulated, so the wait is
    /// chunked against the real clock and re-checks `now()` each round.
    pub fn wait_until<F>(&self, guard: &LockGuard<'_>, deadline: Timestamp, now: F) -> DbResult<()>
    where
        F: Fn() -> Timestamp,
    {
        match self.mode() {
            LockMode::Native => loop {
                let t = now();
                if t >= deadline {
                    return Err(DbError::Timeout);
                }
                let chunk = deadline.saturating_sub(t).min(WAIT_CHUNK);
                let abs = realtime_after(chunk);
                let rc = unsafe {
                    libc::pthread_cond_timedwait(
                        self.native.get(),
                        guard.lock.native.get(),
                        &abs,
                    )
                };
                match rc {
                    0 => return Ok(()),
                    libc::ETIMEDOUT => continue,
                    other => {
                        return Err(DbError::Internal(format!(
                            "pthread_cond_timedwait failed: {other}"
                        )))
                    }
                }
            },
            LockMode::Emulated => {
                let start_seq = self.seq.load(Ordering::Acquire);
                loop {
                    guard.lock.unlock_raw();
                    std::thread::sleep(COND_POLL);
                    // Relock before inspecting state so the caller's
                    // predicate check stays under the lock.
                    let relock = guard.lock.lock();
                    std::mem::forget(relock);
                    if self.seq.load(Ordering::Acquire) != start_seq {
                        return Ok(());
                    }
                    if now() >= deadline {
                        return Err(DbError::Timeout);
                    }
                }
            }
        }
    }
}

/// Absolute CLOCK_REALTIME timespec `d` from now, for pthread timedwait.
fn realtime_after(d: Duration) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    let mut sec = ts.tv_sec + d.as_secs() as libc::time_t;
    let mut nsec = ts.tv_nsec + d.subsec_nanos() as libc::c_long;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}
