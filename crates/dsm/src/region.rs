// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Doubly-mapped chunk memory.
//!
//! A [`PageRegion`] maps one anonymous POSIX shared-memory object twice:
//!
//! - the **app view**, handed to the application, whose per-page protection
//!   follows the coherence state and whose violations raise the fault trap
//! - the **sys view**, always read/write, used by the node's own threads to
//!   install and serve page bytes
//!
//! Installing bytes through the sys view means the application never observes
//! a page with temporarily widened protection.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Local access right on a page of the app view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Protection {
    None = 0,
    Read = 1,
    Write = 2,
}

impl Protection {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            2 => Self::Write,
            1 => Self::Read,
            _ => Self::None,
        }
    }

    fn to_prot(self) -> libc::c_int {
        match self {
            Self::None => libc::PROT_NONE,
            Self::Read => libc::PROT_READ,
            Self::Write => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "NONE",
            Self::Read => "READ",
            Self::Write => "WRITE",
        })
    }
}

static SEGMENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Two mappings of the same pages.
///
/// Both views are unmapped on drop.
pub struct PageRegion {
    sys: *mut u8,
    app: *mut u8,
    len: usize,
    page_size: usize,
}

// SAFETY: the region owns both mappings; all mutation of the mapped bytes
// goes through explicit copy methods whose callers serialize per page.
unsafe impl Send for PageRegion {}
unsafe impl Sync for PageRegion {}

impl PageRegion {
    /// Map `pages` pages, app view starting at `initial` protection.
    pub fn create(pages: usize, page_size: usize, initial: Protection) -> Result<Self> {
        let len = pages
            .checked_mul(page_size)
            .filter(|&l| l > 0)
            .ok_or_else(|| Error::InvalidState(format!("cannot map {} pages", pages)))?;

        let fd = Self::open_anonymous()?;

        // SAFETY: fd is a freshly opened shm object owned by this function.
        let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and closed exactly once on this path.
            unsafe { libc::close(fd) };
            return Err(Error::Region(err));
        }

        let mapped = Self::map(fd, len, libc::PROT_READ | libc::PROT_WRITE).and_then(|sys| {
            match Self::map(fd, len, initial.to_prot()) {
                Ok(app) => Ok((sys, app)),
                Err(e) => {
                    // SAFETY: sys was mapped above with exactly `len` bytes.
                    unsafe { libc::munmap(sys as *mut libc::c_void, len) };
                    Err(e)
                }
            }
        });

        // SAFETY: the mappings hold their own reference to the object.
        unsafe { libc::close(fd) };

        let (sys, app) = mapped.map_err(Error::Region)?;
        Ok(Self {
            sys,
            app,
            len,
            page_size,
        })
    }

    /// Create and immediately unlink a uniquely named shm object.
    fn open_anonymous() -> Result<libc::c_int> {
        let pid = std::process::id();
        for _ in 0..16 {
            let seq = SEGMENT_SEQ.fetch_add(1, Ordering::Relaxed);
            let name = format!("/dsm_{}_{}", pid, seq);
            let c_name = CString::new(name).map_err(|e| Error::Region(io::Error::other(e)))?;

            // SAFETY: c_name is a valid NUL-terminated string; O_EXCL guarantees
            // the object is ours, and unlinking right away leaves only our fd.
            let fd = unsafe {
                let fd = libc::shm_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                    0o600,
                );
                if fd >= 0 {
                    libc::shm_unlink(c_name.as_ptr());
                }
                fd
            };
            if fd >= 0 {
                return Ok(fd);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(Error::Region(err));
            }
        }
        Err(Error::Region(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free shm name",
        )))
    }

    fn map(fd: libc::c_int, len: usize, prot: libc::c_int) -> io::Result<*mut u8> {
        // SAFETY: null hint lets the kernel pick the address; fd is a valid
        // shm object of at least `len` bytes; MAP_FAILED is checked below.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    /// Mapped length in bytes (a whole number of pages).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.len / self.page_size
    }

    /// Base of the app view.
    pub fn app_ptr(&self) -> *mut u8 {
        self.app
    }

    /// Change the app-view protection of one page.
    pub fn protect(&self, page: usize, prot: Protection) -> Result<()> {
        assert!(page < self.page_count(), "page {} out of range", page);
        // SAFETY: the range is one whole page inside the app mapping.
        let ret = unsafe {
            libc::mprotect(
                self.app.add(page * self.page_size) as *mut libc::c_void,
                self.page_size,
                prot.to_prot(),
            )
        };
        if ret < 0 {
            return Err(Error::Region(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Copy one page out of the sys view.
    pub fn read_page(&self, page: usize) -> Vec<u8> {
        assert!(page < self.page_count(), "page {} out of range", page);
        let mut out = vec![0u8; self.page_size];
        // SAFETY: source is one whole page inside the sys mapping, which is
        // always readable; destination is a fresh buffer of the same size.
        unsafe {
            ptr::copy_nonoverlapping(
                self.sys.add(page * self.page_size),
                out.as_mut_ptr(),
                self.page_size,
            );
        }
        out
    }

    /// Copy bytes into one page through the sys view.
    ///
    /// Shorter input leaves the rest of the page untouched.
    pub fn write_page(&self, page: usize, data: &[u8]) {
        assert!(page < self.page_count(), "page {} out of range", page);
        let n = data.len().min(self.page_size);
        // SAFETY: destination is inside the always-writable sys mapping and
        // n never exceeds one page.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.sys.add(page * self.page_size), n);
        }
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        // SAFETY: both pointers were returned by mmap with `len` bytes and are
        // unmapped exactly once here.
        unsafe {
            libc::munmap(self.app as *mut libc::c_void, self.len);
            libc::munmap(self.sys as *mut libc::c_void, self.len);
        }
    }
}

impl fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRegion")
            .field("app", &self.app)
            .field("len", &self.len)
            .finish()
    }
}
