//! Size class table with slab geometry.
//!
//! Objects are bucketed into fixed size classes. Small classes (up to 8 KiB)
//! are slab-backed: the shared domain carves slabs into fixed-size regions
//! and the per-class region count drives how many objects a thread cache may
//! hold for that class. Larger classes are tracked by the owning domain as a
//! whole and cached with a fixed per-class slot count.

use crate::PAGE_SIZE;

/// Geometry of a single size class.
#[derive(Clone, Copy, Debug)]
pub struct SizeClassInfo {
    /// Allocation size for this class (bytes); requests are rounded up.
    pub size: usize,
    /// Pages per slab for this class (small classes only; advisory for
    /// large classes).
    pub slab_pages: usize,
}

impl SizeClassInfo {
    /// Number of fixed-size regions a full slab of this class holds.
    pub const fn regions_per_slab(&self) -> usize {
        (self.slab_pages * PAGE_SIZE) / self.size
    }
}

const fn sc(size: usize, slab_pages: usize) -> SizeClassInfo {
    SizeClassInfo { size, slab_pages }
}

/// Number of defined size classes (index 0 is a sentinel).
pub const NUM_SIZE_CLASSES: usize = 46;

/// Classes below this index are small (slab-backed, per-class bin locks in
/// the domain). Classes at or above it are large (per-domain lock).
pub const NUM_SMALL_CLASSES: usize = 37;

/// Largest small-class size.
pub const MAX_SMALL_SIZE: usize = 8192;

/// Largest size covered by any class; beyond this nothing is cacheable.
pub const MAX_CLASSED_SIZE: usize = 262144;

/// The size class table. Index 0 is a sentinel (unused).
pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = [
    sc(0, 0),
    // 8-byte increments
    sc(8, 1), sc(16, 1), sc(24, 1), sc(32, 1),
    sc(40, 1), sc(48, 1), sc(56, 1), sc(64, 1),
    // 16-byte increments
    sc(80, 1), sc(96, 1), sc(112, 1), sc(128, 1),
    // 32-byte increments
    sc(160, 1), sc(192, 1), sc(224, 1), sc(256, 1),
    // 64-byte increments
    sc(320, 1), sc(384, 1), sc(448, 1), sc(512, 1),
    // 128-byte increments
    sc(640, 1), sc(768, 1), sc(896, 1), sc(1024, 1),
    // 256-byte increments
    sc(1280, 1), sc(1536, 1), sc(1792, 1), sc(2048, 1),
    // 512-byte increments
    sc(2560, 1), sc(3072, 1), sc(3584, 1), sc(4096, 1),
    // 1 KiB increments, two-page slabs
    sc(5120, 2), sc(6144, 2), sc(7168, 2), sc(8192, 2),
    // Large classes: domain-granularity tracking, no slab bins.
    sc(10240, 2), sc(12288, 2), sc(16384, 2), sc(20480, 3),
    sc(32768, 4), sc(40960, 5), sc(65536, 8), sc(131072, 16), sc(262144, 32),
];

/// True for classes whose free objects live in per-class slab bins.
#[inline]
pub const fn is_small_class(class: usize) -> bool {
    class != 0 && class < NUM_SMALL_CLASSES
}

/// Lookup table for sizes <= 1024, indexed by `(size + 7) / 8`.
const SMALL_LOOKUP_LEN: usize = 129;

static SMALL_LOOKUP: [u8; SMALL_LOOKUP_LEN] = const {
    let mut table = [0u8; SMALL_LOOKUP_LEN];
    let mut i = 0;
    while i < SMALL_LOOKUP_LEN {
        let size = i * 8;
        let mut cls = 1u8;
        while (cls as usize) < NUM_SIZE_CLASSES && SIZE_CLASSES[cls as usize].size < size {
            cls += 1;
        }
        table[i] = cls;
        i += 1;
    }
    table
};

/// Map an allocation size to its size class index.
///
/// Returns a class in `1..NUM_SIZE_CLASSES` for sizes up to
/// [`MAX_CLASSED_SIZE`], and 0 for anything larger (uncacheable).
#[inline]
pub fn size_to_class(size: usize) -> usize {
    if size > MAX_CLASSED_SIZE {
        return 0;
    }
    if size <= 1024 {
        return SMALL_LOOKUP[(size + 7) / 8] as usize;
    }
    // Few classes above 1024; a linear scan is fine on this cold path.
    let mut cls = SMALL_LOOKUP[SMALL_LOOKUP_LEN - 1] as usize;
    while SIZE_CLASSES[cls].size < size {
        cls += 1;
    }
    cls
}

/// Allocation size for a given class index.
#[inline]
pub fn class_to_size(class: usize) -> usize {
    SIZE_CLASSES[class].size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_sizes_round_trip() {
        for cls in 1..NUM_SIZE_CLASSES {
            let size = class_to_size(cls);
            assert!(size > 0);
            assert_eq!(size_to_class(size), cls, "class {cls} (size {size})");
        }
    }

    #[test]
    fn sizes_round_up() {
        assert_eq!(class_to_size(size_to_class(1)), 8);
        assert_eq!(class_to_size(size_to_class(9)), 16);
        assert_eq!(class_to_size(size_to_class(65)), 80);
        assert_eq!(class_to_size(size_to_class(1025)), 1280);
        assert_eq!(class_to_size(size_to_class(8193)), 10240);
        assert_eq!(class_to_size(size_to_class(200000)), 262144);
    }

    #[test]
    fn zero_maps_to_smallest_class() {
        assert_eq!(size_to_class(0), 1);
    }

    #[test]
    fn oversized_is_unclassed() {
        assert_eq!(size_to_class(MAX_CLASSED_SIZE + 1), 0);
        assert_eq!(size_to_class(10 << 20), 0);
    }

    #[test]
    fn small_large_split() {
        assert!(is_small_class(1));
        assert!(is_small_class(NUM_SMALL_CLASSES - 1));
        assert!(!is_small_class(NUM_SMALL_CLASSES));
        assert!(!is_small_class(0));
        assert_eq!(class_to_size(NUM_SMALL_CLASSES - 1), MAX_SMALL_SIZE);
    }

    #[test]
    fn table_monotonic_and_aligned() {
        for cls in 2..NUM_SIZE_CLASSES {
            assert!(SIZE_CLASSES[cls].size > SIZE_CLASSES[cls - 1].size);
        }
        for cls in 1..NUM_SIZE_CLASSES {
            assert_eq!(SIZE_CLASSES[cls].size % 8, 0);
        }
    }

    #[test]
    fn small_slabs_hold_regions() {
        for cls in 1..NUM_SMALL_CLASSES {
            let info = &SIZE_CLASSES[cls];
            let regions = info.regions_per_slab();
            assert!(regions >= 1, "class {cls} slab holds no regions");
            assert!(regions * info.size <= info.slab_pages * PAGE_SIZE);
        }
    }
}
