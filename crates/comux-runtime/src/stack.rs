//! Coroutine stack regions
//!
//! Each coroutine owns an anonymous private mapping with a PROT_NONE
//! guard page below the usable region, so overflow faults instead of
//! silently corrupting neighbouring memory. The region must stay mapped
//! and unmoved for as long as the coroutine is not Dead.

use crate::last_errno;
use comux_core::constants::GUARD_SIZE;
use comux_core::error::{CoroError, CoroResult};
use std::ptr;

/// Owned, mmap-backed stack for one coroutine.
pub struct StackRegion {
    /// Mapping base (start of the guard page)
    base: *mut u8,

    /// Total mapping length including the guard page
    total: usize,

    /// Usable byte count above the guard page
    usable: usize,
}

impl StackRegion {
    /// Map a stack with at least `requested` usable bytes.
    ///
    /// The request is rounded up to whole pages and a guard page is
    /// placed below the usable region.
    pub fn new(requested: usize) -> CoroResult<Self> {
        let page = page_size();
        let usable = requested.max(page).next_multiple_of(page);
        let guard = GUARD_SIZE.max(page);
        let total = usable + guard;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CoroError::StackSetupFailed(last_errno()));
        }

        // Open up everything above the guard page.
        let rc = unsafe {
            libc::mprotect(
                (base as *mut u8).add(guard) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let errno = last_errno();
            unsafe { libc::munmap(base, total) };
            return Err(CoroError::StackSetupFailed(errno));
        }

        Ok(Self {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// One-past-the-end address of the usable region; initial stack
    /// pointer for a fresh context.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable byte count (excludes the guard page)
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.usable
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe { libc::munmap(self.base as *mut libc::c_void, self.total) };
        }
    }
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounds_up_to_pages() {
        let stack = StackRegion::new(1000).unwrap();
        assert!(stack.usable_size() >= 1000);
        assert_eq!(stack.usable_size() % page_size(), 0);
    }

    #[test]
    fn test_stack_top_is_aligned() {
        let stack = StackRegion::new(32 * 1024).unwrap();
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn test_stack_is_writable_near_top() {
        let stack = StackRegion::new(32 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }
}
