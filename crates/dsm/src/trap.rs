// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide SIGSEGV/SIGBUS trap for chunk memory.
//!
//! Registered app views live in a fixed, lock-free slot table so the handler
//! can find the owning chunk with atomic loads only. A fault inside a
//! registered view is posted to that node's [`FaultMailbox`]; the handler
//! returns once the page was installed and the access is retried. A fault
//! anywhere else restores the previous disposition and returns, so the
//! access faults again under the original handler.

use crate::error::{Error, Result};
use crate::fault::{FaultAccess, FaultMailbox};
use crate::protocol::ChunkId;
use parking_lot::Mutex;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Maximum number of chunk views registered at once, process-wide.
pub const MAX_TRAP_REGIONS: usize = 256;

const FREE: u8 = 0;
const CLAIMED: u8 = 1;
const ACTIVE: u8 = 2;

struct TrapSlot {
    state: AtomicU8,
    base: AtomicUsize,
    len: AtomicUsize,
    chunk_id: AtomicU64,
    mailbox: AtomicPtr<FaultMailbox>,
}

impl TrapSlot {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Self = Self {
        state: AtomicU8::new(FREE),
        base: AtomicUsize::new(0),
        len: AtomicUsize::new(0),
        chunk_id: AtomicU64::new(0),
        mailbox: AtomicPtr::new(ptr::null_mut()),
    };
}

static SLOTS: [TrapSlot; MAX_TRAP_REGIONS] = [TrapSlot::EMPTY; MAX_TRAP_REGIONS];

struct PreviousActions {
    segv: libc::sigaction,
    bus: libc::sigaction,
}

static PREVIOUS: OnceLock<PreviousActions> = OnceLock::new();
static INSTALLED: Mutex<bool> = parking_lot::const_mutex(false);

const FATAL_MSG: &[u8] = b"dsm: unable to resolve page fault, aborting\n";

/// Install the trap for SIGSEGV and SIGBUS. Idempotent.
pub fn install() -> Result<()> {
    let mut installed = INSTALLED.lock();
    if *installed {
        return Ok(());
    }
    let segv = set_handler(libc::SIGSEGV)?;
    let bus = set_handler(libc::SIGBUS)?;
    let _ = PREVIOUS.set(PreviousActions { segv, bus });
    *installed = true;
    log::debug!("[dsm] fault trap installed");
    Ok(())
}

fn set_handler(signal: libc::c_int) -> Result<libc::sigaction> {
    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = on_fault;
    // SAFETY: both sigaction structs are zero-initialized plain C data, the
    // handler has the SA_SIGINFO signature, and the out-pointer is valid.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);

        let mut previous: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signal, &action, &mut previous) != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(previous)
    }
}

/// Keeps a view registered with the trap; unregisters on drop.
#[derive(Debug)]
pub struct TrapRegistration {
    slot: usize,
    _mailbox: Arc<FaultMailbox>,
}

impl TrapRegistration {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for TrapRegistration {
    fn drop(&mut self) {
        let slot = &SLOTS[self.slot];
        slot.state.store(CLAIMED, Ordering::Release);
        slot.base.store(0, Ordering::Relaxed);
        slot.len.store(0, Ordering::Relaxed);
        slot.mailbox.store(ptr::null_mut(), Ordering::Relaxed);
        slot.state.store(FREE, Ordering::Release);
    }
}

/// Route faults in `[base, base + len)` to `mailbox` as faults on `chunk_id`.
pub fn register(
    base: *mut u8,
    len: usize,
    chunk_id: ChunkId,
    mailbox: &Arc<FaultMailbox>,
) -> Result<TrapRegistration> {
    for (idx, slot) in SLOTS.iter().enumerate() {
        if slot
            .state
            .compare_exchange(FREE, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }
        slot.base.store(base as usize, Ordering::Relaxed);
        slot.len.store(len, Ordering::Relaxed);
        slot.chunk_id.store(chunk_id, Ordering::Relaxed);
        slot.mailbox
            .store(Arc::as_ptr(mailbox).cast_mut(), Ordering::Relaxed);
        slot.state.store(ACTIVE, Ordering::Release);
        return Ok(TrapRegistration {
            slot: idx,
            _mailbox: Arc::clone(mailbox),
        });
    }
    Err(Error::TrapTableFull)
}

/// Number of registered views.
pub fn active_regions() -> usize {
    SLOTS
        .iter()
        .filter(|s| s.state.load(Ordering::Acquire) == ACTIVE)
        .count()
}

fn lookup(addr: usize) -> Option<(ChunkId, u64, *const FaultMailbox)> {
    SLOTS.iter().find_map(|slot| {
        if slot.state.load(Ordering::Acquire) != ACTIVE {
            return None;
        }
        let base = slot.base.load(Ordering::Relaxed);
        let len = slot.len.load(Ordering::Relaxed);
        if addr < base || addr - base >= len {
            return None;
        }
        Some((
            slot.chunk_id.load(Ordering::Relaxed),
            (addr - base) as u64,
            slot.mailbox.load(Ordering::Relaxed).cast_const(),
        ))
    })
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(not(target_os = "linux"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

// Bit 1 of the x86 page-fault error code is set for writes.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn access_hint(context: *const libc::c_void) -> FaultAccess {
    let uc = context.cast::<libc::ucontext_t>();
    let err = (*uc).uc_mcontext.gregs[libc::REG_ERR as usize];
    if err & 0x2 != 0 {
        FaultAccess::Write
    } else {
        FaultAccess::Read
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
unsafe fn access_hint(_context: *const libc::c_void) -> FaultAccess {
    FaultAccess::Unknown
}

fn restore_previous(signal: libc::c_int) {
    let previous = PREVIOUS.get().map(|p| {
        if signal == libc::SIGBUS {
            &p.bus as *const libc::sigaction
        } else {
            &p.segv as *const libc::sigaction
        }
    });
    // SAFETY: sigaction is async-signal-safe; the saved actions are static.
    unsafe {
        match previous {
            Some(action) => {
                libc::sigaction(signal, action, ptr::null_mut());
            }
            None => {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
    }
}

extern "C" fn on_fault(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    let addr = unsafe { fault_address(info) };
    let Some((chunk_id, offset, mailbox)) = lookup(addr) else {
        restore_previous(signal);
        return;
    };
    // SAFETY: the kernel passes a valid ucontext for SA_SIGINFO handlers.
    let access = unsafe { access_hint(context) };
    // SAFETY: the registration keeps the mailbox alive while the slot is
    // active, and the node holds it until every registration is dropped.
    let resolved = unsafe { (*mailbox).post_and_wait(chunk_id, offset, access) };
    if !resolved {
        // SAFETY: write(2) and abort(3) are async-signal-safe.
        unsafe {
            libc::write(libc::STDERR_FILENO, FATAL_MSG.as_ptr().cast(), FATAL_MSG.len());
            libc::abort();
        }
    }
}
