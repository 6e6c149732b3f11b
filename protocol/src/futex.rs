// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Cross-process wait/wake on 32-bit words inside the shared region.
//!
//! On Linux this is a shared (non-private) futex, which works across
//! processes mapping the same file. Other platforms fall back to short
//! sleeps bounded by the caller's timeout.

use std::io;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Outcome of a single futex wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FutexWait {
    /// Woken up, or the word no longer held the expected value
    Woken,
    /// The timeout elapsed
    TimedOut,
}

#[cfg(target_os = "linux")]
pub(crate) fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> io::Result<FutexWait> {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    // SAFETY: `word` is a valid, aligned 4-byte atomic for the duration of the
    // call and `ts` outlives it. FUTEX_WAIT without FUTEX_PRIVATE_FLAG keys the
    // wait on the backing page so peers mapping the same file share it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret == 0 {
        return Ok(FutexWait::Woken);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ETIMEDOUT) => Ok(FutexWait::TimedOut),
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(FutexWait::Woken),
        _ => Err(err),
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn futex_wake(word: &AtomicU32) -> io::Result<usize> {
    // SAFETY: `word` is a valid, aligned 4-byte atomic; FUTEX_WAKE only uses
    // the address as a key and never dereferences beyond it.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Polling step used where no futex is available
#[cfg(not(target_os = "linux"))]
const POLL_STEP: Duration = Duration::from_micros(500);

#[cfg(not(target_os = "linux"))]
pub(crate) fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) -> io::Result<FutexWait> {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    let deadline = Instant::now() + timeout;
    loop {
        if word.load(Ordering::Acquire) != expected {
            return Ok(FutexWait::Woken);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(FutexWait::TimedOut);
        }
        std::thread::sleep(POLL_STEP.min(deadline - now));
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn futex_wake(_word: &AtomicU32) -> io::Result<usize> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_wait_returns_immediately_on_changed_word() {
        let word = AtomicU32::new(5);
        let res = futex_wait(&word, 4, Duration::from_secs(5)).unwrap();
        assert_eq!(res, FutexWait::Woken);
    }

    #[test]
    fn test_wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let res = futex_wait(&word, 0, Duration::from_millis(20)).unwrap();
        assert_eq!(res, FutexWait::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wake_from_other_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let waker = {
            let word = word.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                word.fetch_add(1, Ordering::Release);
                futex_wake(&word).unwrap();
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while word.load(Ordering::Acquire) == 0 && Instant::now() < deadline {
            futex_wait(&word, 0, Duration::from_millis(100)).unwrap();
        }
        waker.join().unwrap();
        assert_eq!(word.load(Ordering::Acquire), 1);
    }
}
