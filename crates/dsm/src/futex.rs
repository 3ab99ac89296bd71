// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Futex wait/wake for the fault mailbox.
//!
//! Both sides of the mailbox live in one process, so the `_PRIVATE` futex
//! operations are used. These are raw syscalls and are safe to issue from a
//! signal handler.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
const FUTEX_WAIT_PRIVATE: i32 = 128;
#[cfg(target_os = "linux")]
const FUTEX_WAKE_PRIVATE: i32 = 129;

/// Block while `*addr == expected`, up to `timeout`.
///
/// Returns 0 on wake (possibly spurious) and -1 on mismatch, timeout or error.
/// Callers re-check the word in a loop.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the call and the
    // remaining arguments match the FUTEX_WAIT calling convention.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT_PRIVATE,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on `addr`.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: addr is a live reference; FUTEX_WAKE ignores the timeout and
    // second address arguments.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE_PRIVATE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

// Non-Linux fallback: callers poll with short sleeps.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> i32 {
    let nap = timeout
        .unwrap_or(Duration::from_micros(200))
        .min(Duration::from_micros(200));
    // SAFETY: nanosleep is async-signal-safe; the timespec outlives the call.
    unsafe {
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: nap.subsec_nanos() as libc::c_long,
        };
        libc::nanosleep(&ts, ptr::null_mut());
    }
    0
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

#[inline]
pub fn futex_wake_one(addr: &AtomicU32) -> i32 {
    futex_wake(addr, 1)
}

#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}
