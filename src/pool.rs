//! The process-wide segment-record reserve (spec §4.1).
//!
//! Allocating a boundary tag while servicing an allocation must never
//! itself recurse into an arena — that's the entire reason this pool
//! exists, and the reason its mutex is distinct from any arena lock (spec
//! §5). Grounded directly in `original_source/src/vmem.c`'s
//! `static_segs[128]` / `free_segs` / `repopulate_segments`, and in the
//! teacher's `init.rs` comment block describing the same bootstrap reserve.

use std::sync::{Mutex, MutexGuard, OnceLock};

use log::{trace, warn};

use crate::error::Error;
use crate::os::PageSource;
use crate::segment::{Segment, SegId};
use crate::stats::PoolStats;

#[cfg(unix)]
use crate::os::UnixMmapPageSource;
#[cfg(not(unix))]
use crate::os::HeapPageSource;

/// Below this many free records, [`SegmentPool::repopulate`] reaches out to
/// the page supplier (spec §4.1: `MIN_RESERVE`, e.g. 8).
pub const MIN_RESERVE: usize = 8;

/// Size of the static bootstrap reserve (spec §4.1: "a statically-sized
/// array (e.g. 128 records)"; `vmem.c`'s `static_segs[128]`).
pub const BOOTSTRAP_RESERVE: usize = 128;

/// The global segment-record reserve. One instance, process-wide, behind
/// [`global_pool`]'s mutex.
pub struct SegmentPool {
    storage: Vec<Segment>,
    free_list: Vec<SegId>,
    page_source: Box<dyn PageSource>,
    pub stats: PoolStats,
}

impl SegmentPool {
    fn with_source(page_source: Box<dyn PageSource>) -> Self {
        let mut pool = SegmentPool {
            storage: Vec::with_capacity(BOOTSTRAP_RESERVE),
            free_list: Vec::with_capacity(BOOTSTRAP_RESERVE),
            page_source,
            stats: PoolStats::default(),
        };
        for _ in 0..BOOTSTRAP_RESERVE {
            let id = pool.storage.len() as SegId;
            pool.storage.push(Segment::default());
            pool.free_list.push(id);
        }
        pool
    }

    /// Acquire an uninitialized segment record (spec §4.1: `seg_acquire`).
    ///
    /// `allow_refill` mirrors `VM_BOOTSTRAP` (spec §6.2): when `false` and
    /// the reserve has run dry, this returns `PoolExhausted` rather than
    /// blocking on the page supplier.
    pub(crate) fn acquire(&mut self, allow_refill: bool) -> Result<SegId, Error> {
        if self.free_list.len() <= MIN_RESERVE {
            if allow_refill {
                self.repopulate()?;
            } else if self.free_list.is_empty() {
                return Err(Error::PoolExhausted);
            }
        }
        let id = self.free_list.pop().ok_or(Error::PoolExhausted)?;
        self.storage[id as usize] = Segment::default();
        self.stats.in_use.increase(1);
        Ok(id)
    }

    /// Return `id` to the reserve (spec §4.1: `seg_release`).
    pub(crate) fn release(&mut self, id: SegId) {
        self.storage[id as usize] = Segment::default();
        self.free_list.push(id);
        self.stats.in_use.decrease(1);
    }

    /// Ensure the reserve holds at least [`MIN_RESERVE`] records, refilling
    /// from the page supplier in ~64-record tranches if not (spec §4.1).
    pub(crate) fn repopulate(&mut self) -> Result<(), Error> {
        if self.free_list.len() > MIN_RESERVE {
            return Ok(());
        }
        let page = self.page_source.alloc_pages(1, &self.stats).ok_or_else(|| {
            warn!("segment pool repopulate: page supplier returned no memory");
            Error::PoolExhausted
        })?;
        let record_size = core::mem::size_of::<Segment>().max(1);
        let n = (page.len() / record_size).max(1);
        trace!("segment pool repopulate: adding {} records", n);
        for _ in 0..n {
            let id = self.storage.len() as SegId;
            self.storage.push(Segment::default());
            self.free_list.push(id);
        }
        Ok(())
    }

    pub(crate) fn get(&self, id: SegId) -> &Segment {
        &self.storage[id as usize]
    }

    pub(crate) fn get_mut(&mut self, id: SegId) -> &mut Segment {
        &mut self.storage[id as usize]
    }

    pub(crate) fn storage_mut(&mut self) -> &mut Vec<Segment> {
        &mut self.storage
    }

    pub(crate) fn storage(&self) -> &[Segment] {
        &self.storage
    }

    /// Number of records currently available without a refill.
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}

fn default_page_source() -> Box<dyn PageSource> {
    #[cfg(unix)]
    {
        Box::new(UnixMmapPageSource::new())
    }
    #[cfg(not(unix))]
    {
        Box::new(HeapPageSource::default())
    }
}

static GLOBAL_POOL: OnceLock<Mutex<SegmentPool>> = OnceLock::new();

/// Seed the global reserve from the static bootstrap array. Idempotent —
/// safe to call more than once, and safe to skip: the first arena operation
/// that needs the pool bootstraps it lazily. Spec §4.1: "the prerequisite
/// for any arena operation... called exactly once at process init."
pub fn bootstrap() {
    GLOBAL_POOL.get_or_init(|| Mutex::new(SegmentPool::with_source(default_page_source())));
}

/// Lock and return the process-global pool, bootstrapping it on first use
/// if [`bootstrap`] was never called explicitly.
pub(crate) fn global_pool() -> MutexGuard<'static, SegmentPool> {
    GLOBAL_POOL
        .get_or_init(|| Mutex::new(SegmentPool::with_source(default_page_source())))
        .lock()
        .expect("segment pool mutex poisoned")
}
