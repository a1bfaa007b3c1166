//! Host page supplier (spec §6.3).
//!
//! The arena core never touches user-addressed memory directly — it only
//! needs pages to back the segment-record pool's refill tranches (spec
//! §4.1). This mirrors the teacher's `os.rs`, trimmed to the one operation
//! the core actually needs (`alloc_pages`) and without the guard-page/
//! large-page machinery mimalloc needs to be *the* global allocator (see
//! DESIGN.md).

use crate::stats::PoolStats;

/// A block of host memory handed back by a [`PageSource`].
pub struct Page {
    ptr: *mut u8,
    len: usize,
    from_mmap: bool,
}

impl Page {
    /// Raw bytes backing this page. The pool only cares about [`Page::len`]
    /// (to size a refill tranche); it never reads or writes through this
    /// pointer.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if self.ptr.is_null() || self.len == 0 {
            return;
        }
        #[cfg(unix)]
        if self.from_mmap {
            // SAFETY: `ptr`/`len` were produced by `mmap` in
            // `UnixMmapPageSource::alloc_pages` with this exact length.
            unsafe { unix::unix_free(self.ptr, self.len) };
            return;
        }
        let _ = self.from_mmap;
        // SAFETY: `ptr`/`len` were produced by `Vec<u8>::into_boxed_slice`
        // in `HeapPageSource::alloc_pages` with this exact length.
        unsafe {
            let slice = core::ptr::slice_from_raw_parts_mut(self.ptr, self.len);
            drop(Box::from_raw(slice));
        }
    }
}

/// External collaborator: supplies host pages for segment-pool refills
/// (spec §6.3: "Page supplier"). Out of scope beyond this narrow interface;
/// implementations may back it with `mmap`, a bump allocator, or plain
/// `Vec` storage.
pub trait PageSource: Send + Sync {
    /// Page size this source hands out, in bytes.
    fn page_size(&self) -> usize;

    /// Allocate `n` pages, or `None` if the host is out of memory.
    fn alloc_pages(&self, n: usize, stats: &PoolStats) -> Option<Page>;
}

/// Default page size used by [`HeapPageSource`] and assumed by callers that
/// don't query [`PageSource::page_size`].
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Portable fallback page source backed by the host heap allocator, for
/// platforms (or tests) where no syscall layer is wanted — the degenerate
/// case spec §4.1 explicitly allows: "the pool may degenerate to direct
/// host allocation."
pub struct HeapPageSource {
    page_size: usize,
}

impl Default for HeapPageSource {
    fn default() -> Self {
        HeapPageSource {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageSource for HeapPageSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc_pages(&self, n: usize, stats: &PoolStats) -> Option<Page> {
        if n == 0 {
            return None;
        }
        let len = self.page_size.checked_mul(n)?;
        let buf = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(buf) as *mut u8;
        stats.refills.increment();
        Some(Page {
            ptr,
            len,
            from_mmap: false,
        })
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use log::warn;

    /// Page source backed by anonymous `mmap`, grounded in the teacher's
    /// `unix_mmap`/`os_mem_alloc`/`os_mem_free` (large-page and guard-page
    /// concerns stripped, see DESIGN.md).
    pub struct UnixMmapPageSource {
        page_size: usize,
    }

    impl UnixMmapPageSource {
        pub fn new() -> Self {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            UnixMmapPageSource {
                page_size: if page_size > 0 {
                    page_size as usize
                } else {
                    DEFAULT_PAGE_SIZE
                },
            }
        }
    }

    impl Default for UnixMmapPageSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PageSource for UnixMmapPageSource {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn alloc_pages(&self, n: usize, stats: &PoolStats) -> Option<Page> {
            if n == 0 {
                return None;
            }
            let len = self.page_size.checked_mul(n)?;
            unsafe {
                let p = libc::mmap(
                    core::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if p == libc::MAP_FAILED {
                    warn!("mmap failed for segment pool refill: {}", errno::errno());
                    return None;
                }
                stats.refills.increment();
                Some(Page {
                    ptr: p as *mut u8,
                    len,
                    from_mmap: true,
                })
            }
        }
    }

    pub(super) unsafe fn unix_free(ptr: *mut u8, len: usize) {
        if libc::munmap(ptr as *mut libc::c_void, len) != 0 {
            warn!(
                "munmap failed: {}, ptr {:p}, len {}",
                errno::errno(),
                ptr,
                len
            );
        }
    }
}

#[cfg(unix)]
pub use unix::UnixMmapPageSource;

/// Round `size` up to the next multiple of `align` (`align` must be a power
/// of two). Mirrors the teacher's `align_up`.
pub fn align_up(size: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// Round `size` down to the previous multiple of `align` (`align` must be a
/// power of two). Mirrors the teacher's `align_down`.
pub fn align_down(size: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    size & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
    }

    #[test]
    fn align_down_rounds_to_previous_multiple() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_down(0x2000, 0x1000), 0x2000);
    }

    #[test]
    fn heap_page_source_reports_requested_size() {
        let stats = PoolStats::default();
        let src = HeapPageSource::default();
        let page = src.alloc_pages(1, &stats).unwrap();
        assert_eq!(page.len(), src.page_size());
        assert_eq!(stats.refills.get(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn unix_mmap_page_source_allocates() {
        let stats = PoolStats::default();
        let src = UnixMmapPageSource::new();
        let page = src.alloc_pages(1, &stats).unwrap();
        assert_eq!(page.len(), src.page_size());
        assert!(!page.as_slice().is_empty());
    }
}
