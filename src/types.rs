//! Core data model: allocation records, access counters, page buckets
//! and hardware samples.

use crate::arena::NIL;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Granularity of per-page access counters.
pub const PAGE_SIZE: u64 = 4096;

/// What kind of memory region a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemKind {
    /// A dynamically allocated buffer (malloc/realloc family)
    Heap,
    /// A thread stack range
    Stack,
    /// A global or library-scope object found in an ELF symbol table
    Global,
    /// A thread-local-storage object
    Tls,
}

/// Direction of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessKind {
    /// Load
    Read = 0,
    /// Store
    Write = 1,
}

/// Number of access kinds (read, write).
pub const ACCESS_KIND_COUNT: usize = 2;

impl AccessKind {
    /// Dense index for counter arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Memory-hierarchy layer that satisfied a sampled access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitLevel {
    /// First-level data cache
    L1,
    /// Second-level cache
    L2,
    /// Last-level cache
    L3,
    /// Line fill buffer
    Lfb,
    /// DRAM attached to the accessing node
    LocalRam,
    /// DRAM attached to a remote node
    RemoteRam,
    /// A remote node's cache
    RemoteCache,
    /// I/O memory
    Io,
    /// Uncached memory
    Uncached,
}

impl HitLevel {
    /// All levels, in report order.
    pub const ALL: [HitLevel; 9] = [
        HitLevel::L1,
        HitLevel::L2,
        HitLevel::L3,
        HitLevel::Lfb,
        HitLevel::LocalRam,
        HitLevel::RemoteRam,
        HitLevel::RemoteCache,
        HitLevel::Io,
        HitLevel::Uncached,
    ];

    /// Human-readable label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            HitLevel::L1 => "L1",
            HitLevel::L2 => "L2",
            HitLevel::L3 => "L3",
            HitLevel::Lfb => "LFB",
            HitLevel::LocalRam => "Local RAM",
            HitLevel::RemoteRam => "Remote RAM",
            HitLevel::RemoteCache => "Remote cache",
            HitLevel::Io => "IO memory",
            HitLevel::Uncached => "Uncached memory",
        }
    }
}

/// Where a sampled access was resolved: a hierarchy level plus whether
/// the access hit or missed at that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitSource {
    /// Level that ultimately satisfied the access
    pub level: HitLevel,
    /// True if the access missed at `level`
    pub missed: bool,
}

impl HitSource {
    /// Dense index into the 18-cell counter array.
    pub fn index(self) -> usize {
        let level = HitLevel::ALL
            .iter()
            .position(|l| *l == self.level)
            .expect("level is one of ALL");
        if self.missed {
            HitLevel::ALL.len() + level
        } else {
            level
        }
    }
}

/// Per-cell access statistics: count plus weight extrema and sum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubCounter {
    /// Number of samples attributed to this cell
    pub count: u64,
    /// Smallest sample weight seen (u64::MAX while empty)
    pub min_weight: u64,
    /// Largest sample weight seen
    pub max_weight: u64,
    /// Sum of all sample weights
    pub sum_weight: u64,
}

impl Default for SubCounter {
    fn default() -> Self {
        Self {
            count: 0,
            min_weight: u64::MAX,
            max_weight: 0,
            sum_weight: 0,
        }
    }
}

impl SubCounter {
    /// Account one sample of the given weight.
    pub fn record(&mut self, weight: u64) {
        self.count += 1;
        self.sum_weight += weight;
        self.min_weight = self.min_weight.min(weight);
        self.max_weight = self.max_weight.max(weight);
    }

    /// Fold another sub-counter into this one. Associative and
    /// commutative; an empty counter is the identity.
    pub fn merge(&mut self, other: &SubCounter) {
        self.count += other.count;
        self.sum_weight += other.sum_weight;
        self.min_weight = self.min_weight.min(other.min_weight);
        self.max_weight = self.max_weight.max(other.max_weight);
    }

    /// Average weight, zero while empty.
    pub fn avg_weight(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum_weight / self.count
        }
    }
}

/// Aggregate access statistics for one access kind: totals plus one
/// sub-counter per (hierarchy level, hit/miss) cell.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemCounters {
    /// All samples attributed here, classified or not
    pub total_count: u64,
    /// Sum of all sample weights
    pub total_weight: u64,
    /// Samples whose hit source could not be classified
    pub na_miss_count: u64,
    /// Hit cells indexed by `HitSource::index` (first 9), then miss cells
    pub cells: [SubCounter; 18],
}

impl MemCounters {
    /// Account one sample.
    pub fn record(&mut self, hit: Option<HitSource>, weight: u64) {
        self.total_count += 1;
        self.total_weight += weight;
        match hit {
            Some(source) => self.cells[source.index()].record(weight),
            None => self.na_miss_count += 1,
        }
    }

    /// Fold `other` into `self` cell by cell.
    pub fn merge(&mut self, other: &MemCounters) {
        self.total_count += other.total_count;
        self.total_weight += other.total_weight;
        self.na_miss_count += other.na_miss_count;
        for (cell, other_cell) in self.cells.iter_mut().zip(other.cells.iter()) {
            cell.merge(other_cell);
        }
    }

    /// Sub-counter for a hit source.
    pub fn cell(&self, source: HitSource) -> &SubCounter {
        &self.cells[source.index()]
    }

    /// True if no sample has ever been recorded here.
    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }
}

/// Per-page access counters for one (allocation, thread) pair.
///
/// Buckets form singly linked lists through the registry's bucket arena,
/// sorted by ascending `page_index`.
#[derive(Debug, Clone)]
pub struct PageBucket {
    /// Offset-in-allocation divided by `PAGE_SIZE`
    pub page_index: u64,
    /// Read and write counters, indexed by `AccessKind::index`
    pub counters: [MemCounters; ACCESS_KIND_COUNT],
    /// Arena handle of the next bucket, `NIL` at the tail
    pub next: u32,
}

impl PageBucket {
    /// A detached bucket for the given page.
    pub fn new(page_index: u64) -> Self {
        Self {
            page_index,
            counters: [MemCounters::default(), MemCounters::default()],
            next: NIL,
        }
    }
}

/// One hardware memory-access sample, as delivered by the sampler.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    /// Virtual address the access touched
    pub addr: u64,
    /// Tick date the event was recorded at
    pub timestamp: u64,
    /// Where the access was satisfied; `None` if unclassifiable
    pub hit: Option<HitSource>,
    /// Cycle cost attributed to the access
    pub weight: u64,
    /// Load or store
    pub access: AccessKind,
    /// Rank of the thread the sample belongs to
    pub thread_rank: u32,
    /// Start of the sampler's attribution window
    pub window_start: u64,
    /// End of the sampler's attribution window
    pub window_stop: u64,
}

/// Opaque handle to an allocation record in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle(pub(crate) u32);

/// The block descriptor the interceptor passes across the ingest API.
///
/// `record_info` is the slot the registry fills at `record_malloc` time;
/// the interceptor hands the same slot back on free and realloc.
#[derive(Debug, Clone, Copy)]
pub struct MemBlockInfo {
    /// User pointer of the block
    pub u_ptr: u64,
    /// Size of the block, in bytes, at the time of the call
    pub size: usize,
    /// Registry handle, set by `record_malloc`
    pub record_info: Option<RecordHandle>,
}

/// Bookkeeping for one tracked memory region.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    /// Monotonically assigned process-unique identifier
    pub id: u32,
    /// Region kind
    pub kind: MemKind,
    /// Start address (re-keyed on realloc moves)
    pub start_addr: u64,
    /// Size at registration
    pub initial_size: usize,
    /// Current size; may shrink when the final size is learned at free
    pub current_size: usize,
    /// Tick date of allocation; 0 for regions present at init
    pub alloc_time: u64,
    /// Tick date of free; 0 while live
    pub free_time: u64,
    /// Program counter of the allocation site
    pub caller_ip: u64,
    /// Call stack captured at allocation; empty for non-heap regions
    pub call_stack: Vec<u64>,
    /// Lazily resolved name for `caller_ip` (or the symbol name for
    /// globals)
    pub resolved_symbol: Option<Arc<str>>,
    /// Per-thread-rank heads of page-bucket lists (`NIL` = no bucket);
    /// empty until the first attribution unless eagerly allocated
    pub per_thread_blocks: Vec<u32>,
}

impl AllocationRecord {
    /// True if `addr` falls inside the record's current range.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start_addr && addr < self.start_addr + self.current_size as u64
    }

    /// Page index of `addr` within this record.
    ///
    /// Callers must ensure `addr` is in range.
    pub fn page_of(&self, addr: u64) -> u64 {
        debug_assert!(addr >= self.start_addr);
        (addr - self.start_addr) / PAGE_SIZE
    }

    /// True once the record has been moved to the past collection.
    pub fn is_freed(&self) -> bool {
        self.free_time != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_source_indexing_is_dense_and_unique() {
        let mut seen = [false; 18];
        for level in HitLevel::ALL {
            for missed in [false, true] {
                let idx = HitSource { level, missed }.index();
                assert!(!seen[idx], "duplicate index {idx}");
                seen[idx] = true;
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn sub_counter_tracks_extrema() {
        let mut c = SubCounter::default();
        c.record(40);
        assert_eq!(
            (c.count, c.min_weight, c.max_weight, c.sum_weight),
            (1, 40, 40, 40)
        );
        c.record(10);
        assert_eq!(
            (c.count, c.min_weight, c.max_weight, c.sum_weight),
            (2, 10, 40, 50)
        );
        assert_eq!(c.avg_weight(), 25);
    }

    #[test]
    fn counter_fold_is_order_independent() {
        let samples: Vec<(Option<HitSource>, u64)> = vec![
            (
                Some(HitSource {
                    level: HitLevel::L1,
                    missed: false,
                }),
                3,
            ),
            (
                Some(HitSource {
                    level: HitLevel::L2,
                    missed: false,
                }),
                40,
            ),
            (
                Some(HitSource {
                    level: HitLevel::RemoteRam,
                    missed: true,
                }),
                250,
            ),
            (None, 7),
            (
                Some(HitSource {
                    level: HitLevel::L2,
                    missed: false,
                }),
                10,
            ),
        ];

        // One counter per sample, folded in two different orders.
        let parts: Vec<MemCounters> = samples
            .iter()
            .map(|(hit, weight)| {
                let mut c = MemCounters::default();
                c.record(*hit, *weight);
                c
            })
            .collect();

        let mut forward = MemCounters::default();
        for p in &parts {
            forward.merge(p);
        }
        let mut backward = MemCounters::default();
        for p in parts.iter().rev() {
            backward.merge(p);
        }

        assert_eq!(forward.total_count, backward.total_count);
        assert_eq!(forward.total_weight, backward.total_weight);
        assert_eq!(forward.na_miss_count, backward.na_miss_count);
        for (a, b) in forward.cells.iter().zip(backward.cells.iter()) {
            assert_eq!(a.count, b.count);
            assert_eq!(a.min_weight, b.min_weight);
            assert_eq!(a.max_weight, b.max_weight);
            assert_eq!(a.sum_weight, b.sum_weight);
        }
    }

    #[test]
    fn merging_an_empty_counter_is_identity() {
        let mut c = MemCounters::default();
        c.record(
            Some(HitSource {
                level: HitLevel::L3,
                missed: false,
            }),
            100,
        );
        let before = c.clone();
        c.merge(&MemCounters::default());
        assert_eq!(c.total_count, before.total_count);
        assert_eq!(c.cells[2].min_weight, before.cells[2].min_weight);
        assert_eq!(c.cells[2].max_weight, before.cells[2].max_weight);
    }

    #[test]
    fn page_index_round_trips() {
        let record = AllocationRecord {
            id: 1,
            kind: MemKind::Heap,
            start_addr: 0x1000,
            initial_size: 3 * PAGE_SIZE as usize + 100,
            current_size: 3 * PAGE_SIZE as usize + 100,
            alloc_time: 1,
            free_time: 0,
            caller_ip: 0xA,
            call_stack: Vec::new(),
            resolved_symbol: None,
            per_thread_blocks: Vec::new(),
        };
        for addr in
            (record.start_addr..record.start_addr + record.current_size as u64).step_by(777)
        {
            let page = record.page_of(addr);
            let page_start = record.start_addr + page * PAGE_SIZE;
            assert!(page_start <= addr && addr < page_start + PAGE_SIZE);
        }
    }
}
