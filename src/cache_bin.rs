//! Per-class cache bin: a fixed-capacity pointer stack with adaptive-fill
//! state, plus the boot-computed capacity table and the GC tick counter.
//!
//! A bin is only ever touched by its cache's single logical owner, so none
//! of this is synchronized. Slot 0 is the bottom of the stack (least
//! recently freed); flushes drain from the bottom so the hottest objects
//! stay cached.

use core::ptr::NonNull;

use crate::size_class::{self, SIZE_CLASSES, is_small_class};

/// Fewest slots a small-class bin gets, regardless of slab geometry.
pub const NSLOTS_SMALL_MIN: usize = 20;

/// Most slots a small-class bin gets.
pub const NSLOTS_SMALL_MAX: usize = 200;

/// Fixed slot count for large-class bins.
pub const NSLOTS_LARGE: usize = 20;

/// Cached slot budget for one small class: twice the slab region count,
/// clamped to [`NSLOTS_SMALL_MIN`]..=[`NSLOTS_SMALL_MAX`].
pub const fn ncached_max_for_regions(regions: usize) -> usize {
    let doubled = regions * 2;
    if doubled < NSLOTS_SMALL_MIN {
        NSLOTS_SMALL_MIN
    } else if doubled > NSLOTS_SMALL_MAX {
        NSLOTS_SMALL_MAX
    } else {
        doubled
    }
}

/// Immutable map from size-class index to maximum cached objects.
///
/// Computed exactly once, after slab geometry is finalized; a change to the
/// underlying geometry requires rebooting the table (and every cache built
/// from it).
#[derive(Debug)]
pub struct BinCapacityTable {
    ncached_max: Box<[u32]>,
}

impl BinCapacityTable {
    /// Build the table covering every class whose size is at most
    /// `max_cached_size` (clamped to cover at least all small classes and at
    /// most every defined class).
    pub fn boot(max_cached_size: usize) -> Self {
        let ceiling = max_cached_size
            .clamp(size_class::MAX_SMALL_SIZE, size_class::MAX_CLASSED_SIZE);
        let nclasses = size_class::size_to_class(ceiling) + 1;

        let mut table = Vec::with_capacity(nclasses);
        table.push(0u32); // class 0 sentinel
        for cls in 1..nclasses {
            let max = if is_small_class(cls) {
                ncached_max_for_regions(SIZE_CLASSES[cls].regions_per_slab())
            } else {
                NSLOTS_LARGE
            };
            table.push(max as u32);
        }
        Self { ncached_max: table.into_boxed_slice() }
    }

    /// Number of cacheable classes (including the class 0 sentinel).
    #[inline]
    pub fn nclasses(&self) -> usize {
        self.ncached_max.len()
    }

    /// Maximum cached objects for `class`.
    #[inline]
    pub fn ncached_max(&self, class: usize) -> usize {
        self.ncached_max[class] as usize
    }

    /// Worst-case bytes one cache built from this table can hoard.
    pub fn max_footprint(&self) -> usize {
        self.ncached_max
            .iter()
            .enumerate()
            .map(|(cls, &max)| max as usize * SIZE_CLASSES[cls].size)
            .sum()
    }
}

/// One size class's pointer stack inside a thread cache.
pub struct CacheBin {
    /// Stack storage; index 0 is the least recently freed object. Capacity
    /// is reserved up front and never grown.
    pub(crate) stack: Vec<NonNull<u8>>,
    pub(crate) ncached_max: u32,
    /// Minimum `ncached` seen since the last GC event, or -1 if the bin ran
    /// dry and needed a mid-interval refill.
    pub(crate) low_water: i32,
    /// log2 of the refill divisor: a refill requests
    /// `ncached_max >> lg_fill_div` objects. Always at least 1.
    pub(crate) lg_fill_div: u8,
    /// Allocations served from this bin since the last stats merge.
    pub(crate) nrequests: u64,
}

/// Push rejected: the bin is at capacity and the caller must flush first.
#[derive(Debug, PartialEq, Eq)]
pub struct CacheFull;

impl CacheBin {
    pub fn new(ncached_max: usize) -> Self {
        Self {
            stack: Vec::with_capacity(ncached_max),
            ncached_max: ncached_max as u32,
            low_water: 0,
            lg_fill_div: 1,
            nrequests: 0,
        }
    }

    #[inline]
    pub fn ncached(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn ncached_max(&self) -> usize {
        self.ncached_max as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.stack.len() == self.ncached_max as usize
    }

    /// Cache a freed object. Fails when the bin is full.
    #[inline]
    pub fn push(&mut self, obj: NonNull<u8>) -> Result<(), CacheFull> {
        if self.is_full() {
            return Err(CacheFull);
        }
        self.stack.push(obj);
        Ok(())
    }

    /// Take the most recently cached object. An empty bin records the
    /// ran-dry sentinel so the next GC event grows the refill rate.
    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        match self.stack.pop() {
            Some(obj) => {
                if (self.stack.len() as i32) < self.low_water {
                    self.low_water = self.stack.len() as i32;
                }
                Some(obj)
            }
            None => {
                self.low_water = -1;
                None
            }
        }
    }

    /// Objects to request per refill; at least 1 by the `lg_fill_div`
    /// invariant.
    #[inline]
    pub(crate) fn fill_count(&self) -> usize {
        ((self.ncached_max >> self.lg_fill_div) as usize).max(1)
    }

    #[inline]
    pub(crate) fn take_requests(&mut self) -> u64 {
        core::mem::take(&mut self.nrequests)
    }

    /// Drop the bottom `nflush` slots after a flush has returned them to
    /// their domains, keeping stack order of the survivors.
    pub(crate) fn complete_flush(&mut self, nflush: usize) {
        self.stack.drain(..nflush);
        if (self.stack.len() as i32) < self.low_water {
            self.low_water = self.stack.len() as i32;
        }
    }

    /// Start a fresh GC interval with the watermark at the current level.
    pub(crate) fn reset_low_water(&mut self) {
        self.low_water = self.stack.len() as i32;
    }
}

/// Countdown driving periodic GC events from the allocation/free fast
/// paths.
pub(crate) struct Ticker {
    tick: u32,
    nticks: u32,
}

impl Ticker {
    pub(crate) fn new(nticks: u32) -> Self {
        Self { tick: nticks, nticks }
    }

    /// Returns true when the countdown expires; the ticker rearms itself.
    #[inline]
    pub(crate) fn tick(&mut self) -> bool {
        self.tick -= 1;
        if self.tick == 0 {
            self.tick = self.nticks;
            true
        } else {
            false
        }
    }
}
