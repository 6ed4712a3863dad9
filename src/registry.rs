//! The allocation registry: live and past allocation tracking.
//!
//! Two AVL indexes over one record arena. Live allocations move to the
//! past index on free and are kept for the rest of the run, because
//! hardware samples arrive with latency: by the time a sample is
//! processed, the buffer it touched may already be gone. Attribution
//! against past allocations uses the sampler's time window.
//!
//! Every index mutation and lookup serializes under one mutex. The lock
//! is never held across symbol resolution or file I/O.

use crate::arena::{ChunkArena, NIL};
use crate::config::ProfilerSettings;
use crate::index::AvlIndex;
use crate::strings;
use crate::types::{
    AccessKind, AllocationRecord, MemCounters, MemKind, PageBucket, RecordHandle, Sample,
    ACCESS_KIND_COUNT,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub(crate) struct RegistryInner {
    pub(crate) records: ChunkArena<AllocationRecord>,
    pub(crate) buckets: ChunkArena<PageBucket>,
    pub(crate) live: AvlIndex,
    pub(crate) past: AvlIndex,
    /// Whole-run counters, one per access kind
    pub(crate) global_counters: [MemCounters; ACCESS_KIND_COUNT],
    next_id: u32,
}

/// Concurrent, time-indexed map from address ranges to allocation
/// records. This is the profiler's hot path.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    origin: Instant,
    settings: ProfilerSettings,
    unattributed: AtomicU64,
}

impl Registry {
    /// Create an empty registry. The moment of creation becomes the
    /// origin date: all record timestamps are ticks since this instant.
    pub fn new(settings: ProfilerSettings) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                records: ChunkArena::new(),
                buckets: ChunkArena::new(),
                live: AvlIndex::new(),
                past: AvlIndex::new(),
                global_counters: [MemCounters::default(), MemCounters::default()],
                next_id: 1,
            }),
            origin: Instant::now(),
            settings,
            unattributed: AtomicU64::new(0),
        }
    }

    /// Current tick date: nanoseconds since the origin, never zero.
    /// Zero is reserved for "present at init" and "still live".
    pub fn now(&self) -> u64 {
        (self.origin.elapsed().as_nanos() as u64).max(1)
    }

    /// Settings the registry was created with.
    pub fn settings(&self) -> &ProfilerSettings {
        &self.settings
    }

    /// Samples that matched neither a live nor a past allocation.
    pub fn unattributed_count(&self) -> u64 {
        self.unattributed.load(Ordering::Relaxed)
    }

    /// Create a record for a new region and insert it into the live
    /// index. Heap regions are stamped with the current tick date;
    /// stack, global and TLS regions existed before the profiler and
    /// get `alloc_time = 0`.
    pub fn register_region(
        &self,
        kind: MemKind,
        addr: u64,
        size: usize,
        caller_ip: u64,
        call_stack: Vec<u64>,
        symbol: Option<&str>,
    ) -> RecordHandle {
        let alloc_time = match kind {
            MemKind::Heap => self.now(),
            MemKind::Stack | MemKind::Global | MemKind::Tls => 0,
        };
        let resolved_symbol = symbol.map(strings::intern);
        let per_thread_blocks = if self.settings.online_analysis {
            vec![NIL; self.settings.max_threads]
        } else {
            Vec::new()
        };

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let record = AllocationRecord {
            id,
            kind,
            start_addr: addr,
            initial_size: size,
            current_size: size,
            alloc_time,
            free_time: 0,
            caller_ip,
            call_stack,
            resolved_symbol,
            per_thread_blocks,
        };
        let handle = inner.records.alloc(record);
        inner.live.insert(addr, handle);
        RecordHandle(handle)
    }

    /// Move a record to a new start address (realloc that relocated the
    /// buffer). Existing page buckets are retained; they describe
    /// accesses to the old placement.
    pub fn update_address(&self, handle: RecordHandle, new_addr: u64) {
        let mut inner = self.inner.lock();
        let old_addr = inner.records.get(handle.0).start_addr;
        inner.live.remove_key_value(old_addr, handle.0);
        inner.records.get_mut(handle.0).start_addr = new_addr;
        inner.live.insert(new_addr, handle.0);
    }

    /// Mark a live record freed: stamp `free_time`, record the final
    /// size, and move it from the live to the past index.
    ///
    /// Panics if the handle is not live; the interceptor passes back
    /// the handle it got at allocation time, so anything else is a
    /// programming error.
    pub fn mark_freed(&self, handle: RecordHandle, final_size: usize) {
        let free_time = self.now();
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(handle.0);
        assert!(
            record.free_time == 0,
            "mark_freed on record id {} which is not live",
            record.id
        );
        record.free_time = free_time;
        record.current_size = final_size;
        let addr = record.start_addr;
        inner.live.remove_key_value(addr, handle.0);
        inner.past.insert(addr, handle.0);
    }

    /// Find the live allocation containing `addr`, if any. A miss is
    /// expected (un-intercepted allocator, or a region not enumerated).
    pub fn find_live_by_address(&self, addr: u64) -> Option<RecordHandle> {
        let inner = self.inner.lock();
        Self::lookup_live(&inner, addr)
    }

    /// Find a past allocation containing `addr` whose lifetime overlaps
    /// the window `[t_start, t_stop]`. Pre-existing regions
    /// (`alloc_time == 0`) always match.
    pub fn find_past_by_address_and_window(
        &self,
        addr: u64,
        t_start: u64,
        t_stop: u64,
    ) -> Option<RecordHandle> {
        let inner = self.inner.lock();
        Self::lookup_past(&inner, addr, t_start, t_stop)
    }

    /// Attribute one hardware sample: live lookup first, then the past
    /// index under the sampler's window, then give up and count the
    /// sample as unattributed. On a hit, the matching page bucket for
    /// the sample's thread is found or created and its counters
    /// updated, as are the whole-run global counters.
    ///
    /// Returns the record the sample was charged to, if any.
    pub fn attribute_sample(&self, sample: &Sample) -> Option<RecordHandle> {
        let mut inner = self.inner.lock();
        let handle = Self::lookup_live(&inner, sample.addr).or_else(|| {
            Self::lookup_past(&inner, sample.addr, sample.window_start, sample.window_stop)
        })?;

        let max_threads = self.settings.max_threads;
        let rank = sample.thread_rank as usize;
        if rank >= max_threads {
            // Rank beyond the configured capacity; drop rather than
            // grow every record's bucket array. The caller counts the
            // sample as unattributed.
            return None;
        }

        let inner = &mut *inner;
        let record = inner.records.get_mut(handle.0);
        let page = record.page_of(sample.addr);
        if record.per_thread_blocks.is_empty() {
            record.per_thread_blocks.resize(max_threads, NIL);
        }
        let bucket = get_or_insert_bucket(
            &mut inner.buckets,
            &mut record.per_thread_blocks[rank],
            page,
        );
        inner.buckets.get_mut(bucket).counters[sample.access.index()]
            .record(sample.hit, sample.weight);
        inner.global_counters[sample.access.index()].record(sample.hit, sample.weight);
        Some(handle)
    }

    /// Count a sample that matched nothing.
    pub fn count_unattributed(&self) {
        self.unattributed.fetch_add(1, Ordering::Relaxed);
    }

    /// Implicitly free everything still live. Called at shutdown so the
    /// aggregator and reporter see a single, uniform past collection.
    /// Returns the number of leaked allocations.
    pub fn finalize_leaked(&self) -> usize {
        let free_time = self.now();
        let mut inner = self.inner.lock();
        let leaked: Vec<(u64, u32)> = inner
            .live
            .iter()
            .flat_map(|(key, entries)| entries.iter().map(move |h| (key, *h)))
            .collect();
        for (addr, handle) in &leaked {
            let record = inner.records.get_mut(*handle);
            record.free_time = free_time;
            if self.settings.verbose && record.kind == MemKind::Heap {
                tracing::warn!(
                    id = record.id,
                    addr = format_args!("{:#x}", record.start_addr),
                    size = record.current_size,
                    "buffer was never freed"
                );
            }
            inner.live.remove_key_value(*addr, *handle);
            inner.past.insert(*addr, *handle);
        }
        leaked.len()
    }

    /// Clone of the record behind `handle`.
    pub fn record_snapshot(&self, handle: RecordHandle) -> AllocationRecord {
        self.inner.lock().records.get(handle.0).clone()
    }

    /// Clone of the page buckets of `(handle, thread_rank)`, ascending
    /// by page index.
    pub fn bucket_snapshot(&self, handle: RecordHandle, thread_rank: u32) -> Vec<PageBucket> {
        let inner = self.inner.lock();
        let record = inner.records.get(handle.0);
        let mut out = Vec::new();
        let mut cursor = record
            .per_thread_blocks
            .get(thread_rank as usize)
            .copied()
            .unwrap_or(NIL);
        while cursor != NIL {
            let bucket = inner.buckets.get(cursor);
            out.push(bucket.clone());
            cursor = bucket.next;
        }
        out
    }

    /// Whole-run counters for one access kind.
    pub fn global_counters(&self, access: AccessKind) -> MemCounters {
        self.inner.lock().global_counters[access.index()].clone()
    }

    /// Clones of every record ever registered, in registration order.
    /// The lock is released before the caller touches the result, so
    /// reporting never resolves symbols or writes files under it.
    pub fn snapshot_all_records(&self) -> Vec<AllocationRecord> {
        self.inner.lock().records.iter().cloned().collect()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock()
    }

    fn lookup_live(inner: &RegistryInner, addr: u64) -> Option<RecordHandle> {
        let (_, entries) = inner.live.lower_entry(addr)?;
        entries
            .iter()
            .find(|h| inner.records.get(**h).contains(addr))
            .map(|h| RecordHandle(*h))
    }

    fn lookup_past(
        inner: &RegistryInner,
        addr: u64,
        t_start: u64,
        t_stop: u64,
    ) -> Option<RecordHandle> {
        let (_, entries) = inner.past.lower_entry(addr)?;
        entries
            .iter()
            .find(|h| {
                let record = inner.records.get(**h);
                record.contains(addr) && lifetime_overlaps(record, t_start, t_stop)
            })
            .map(|h| RecordHandle(*h))
    }
}

/// The union-of-overlap rule: a past record matches a window if it
/// lived entirely inside it, or the window's start or stop falls within
/// the record's lifetime. Pre-existing regions always match.
fn lifetime_overlaps(record: &AllocationRecord, t_start: u64, t_stop: u64) -> bool {
    if record.alloc_time == 0 {
        return true;
    }
    let (alloc, free) = (record.alloc_time, record.free_time);
    (alloc >= t_start && free <= t_stop)
        || (t_start >= alloc && t_start <= free)
        || (t_stop >= alloc && t_stop <= free)
}

/// Walk the sorted bucket list at `*head` for `page`; splice in a fresh
/// bucket (from the arena) if the page has no bucket yet. Returns the
/// bucket's arena handle.
fn get_or_insert_bucket(buckets: &mut ChunkArena<PageBucket>, head: &mut u32, page: u64) -> u32 {
    if *head == NIL || buckets.get(*head).page_index > page {
        let fresh = buckets.alloc(PageBucket::new(page));
        buckets.get_mut(fresh).next = *head;
        *head = fresh;
        return fresh;
    }
    let mut cursor = *head;
    loop {
        let bucket = buckets.get(cursor);
        if bucket.page_index == page {
            return cursor;
        }
        let next = bucket.next;
        if next == NIL || buckets.get(next).page_index > page {
            let fresh = buckets.alloc(PageBucket::new(page));
            buckets.get_mut(fresh).next = next;
            buckets.get_mut(cursor).next = fresh;
            return fresh;
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HitLevel, HitSource, PAGE_SIZE};

    fn test_registry() -> Registry {
        let mut settings = ProfilerSettings::default();
        settings.max_threads = 8;
        settings.online_analysis = false;
        settings.log_dir = std::env::temp_dir();
        Registry::new(settings)
    }

    fn read_sample(addr: u64, weight: u64, thread_rank: u32, registry: &Registry) -> Sample {
        let now = registry.now();
        Sample {
            addr,
            timestamp: now,
            hit: Some(HitSource {
                level: HitLevel::L2,
                missed: false,
            }),
            weight,
            access: AccessKind::Read,
            thread_rank,
            window_start: now.saturating_sub(1000),
            window_stop: now + 1000,
        }
    }

    #[test]
    fn basic_allocate_free_query() {
        let registry = test_registry();
        let t0 = registry.now();
        let handle = registry.register_region(MemKind::Heap, 0x1000, 64, 0xA, Vec::new(), None);

        let found = registry.find_live_by_address(0x1020);
        assert_eq!(found, Some(handle));
        assert_eq!(registry.find_live_by_address(0x0fff), None);
        assert_eq!(registry.find_live_by_address(0x1040), None);

        registry.mark_freed(handle, 64);
        assert_eq!(registry.find_live_by_address(0x1020), None);

        let t2 = registry.now();
        let past = registry.find_past_by_address_and_window(0x1020, t0, t2);
        assert_eq!(past, Some(handle));

        let record = registry.record_snapshot(handle);
        assert!(record.alloc_time <= record.free_time);
        assert!(record.is_freed());
    }

    #[test]
    fn address_reuse_separates_generations() {
        let registry = test_registry();
        let first = registry.register_region(MemKind::Heap, 0x2000, 32, 0xA, Vec::new(), None);
        let t_first_alive = registry.now();
        registry.mark_freed(first, 32);
        let t_first_dead = registry.now();

        let second = registry.register_region(MemKind::Heap, 0x2000, 32, 0xB, Vec::new(), None);
        assert_eq!(registry.find_live_by_address(0x2000), Some(second));

        // A window straddling the first generation's lifetime finds it.
        let past = registry.find_past_by_address_and_window(0x2000, t_first_alive, t_first_dead);
        assert_eq!(past, Some(first));
    }

    #[test]
    fn realloc_move_rekeys_the_index() {
        let registry = test_registry();
        let handle = registry.register_region(MemKind::Heap, 0x3000, 16, 0xA, Vec::new(), None);
        registry.update_address(handle, 0x4000);

        assert_eq!(registry.find_live_by_address(0x3008), None);
        assert_eq!(registry.find_live_by_address(0x4008), Some(handle));
        assert_eq!(registry.record_snapshot(handle).start_addr, 0x4000);
    }

    #[test]
    #[should_panic(expected = "not live")]
    fn double_free_is_fatal() {
        let registry = test_registry();
        let handle = registry.register_region(MemKind::Heap, 0x5000, 8, 0xA, Vec::new(), None);
        registry.mark_freed(handle, 8);
        registry.mark_freed(handle, 8);
    }

    #[test]
    fn sample_attribution_updates_page_counters() {
        let registry = test_registry();
        let handle = registry.register_region(MemKind::Heap, 0x1000, 64, 0xA, Vec::new(), None);

        let attributed = registry.attribute_sample(&read_sample(0x1020, 40, 0, &registry));
        assert_eq!(attributed, Some(handle));

        let buckets = registry.bucket_snapshot(handle, 0);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].page_index, 0);
        let cell = buckets[0].counters[AccessKind::Read.index()].cell(HitSource {
            level: HitLevel::L2,
            missed: false,
        });
        assert_eq!((cell.count, cell.min_weight, cell.max_weight, cell.sum_weight), (1, 40, 40, 40));

        registry.attribute_sample(&read_sample(0x1020, 10, 0, &registry));
        let buckets = registry.bucket_snapshot(handle, 0);
        let cell = buckets[0].counters[AccessKind::Read.index()].cell(HitSource {
            level: HitLevel::L2,
            missed: false,
        });
        assert_eq!((cell.count, cell.min_weight, cell.max_weight, cell.sum_weight), (2, 10, 40, 50));
    }

    #[test]
    fn attribution_is_per_thread_and_per_page() {
        let registry = test_registry();
        let size = 3 * PAGE_SIZE as usize;
        let handle = registry.register_region(MemKind::Heap, 0x10000, size, 0xA, Vec::new(), None);

        registry.attribute_sample(&read_sample(0x10000 + 2 * PAGE_SIZE, 5, 1, &registry));
        registry.attribute_sample(&read_sample(0x10000, 5, 1, &registry));
        registry.attribute_sample(&read_sample(0x10000, 5, 0, &registry));

        // Thread 1 touched pages 0 and 2; the list is page-ordered even
        // though page 2 was hit first.
        let t1 = registry.bucket_snapshot(handle, 1);
        assert_eq!(t1.iter().map(|b| b.page_index).collect::<Vec<_>>(), vec![0, 2]);
        let t0 = registry.bucket_snapshot(handle, 0);
        assert_eq!(t0.iter().map(|b| b.page_index).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn misses_count_as_unattributed() {
        let registry = test_registry();
        assert_eq!(registry.attribute_sample(&read_sample(0xdead, 1, 0, &registry)), None);
        registry.count_unattributed();
        assert_eq!(registry.unattributed_count(), 1);
    }

    #[test]
    fn freed_buffers_still_attract_windowed_samples() {
        let registry = test_registry();
        let handle = registry.register_region(MemKind::Heap, 0x9000, 128, 0xA, Vec::new(), None);
        let mid = registry.now();
        registry.mark_freed(handle, 128);

        // The sampler's window covers the allocation's lifetime.
        let sample = Sample {
            window_start: mid.saturating_sub(10),
            window_stop: registry.now(),
            ..read_sample(0x9010, 7, 0, &registry)
        };
        assert_eq!(registry.attribute_sample(&sample), Some(handle));
    }

    #[test]
    fn pre_existing_regions_match_any_window() {
        let registry = test_registry();
        let handle =
            registry.register_region(MemKind::Global, 0x7000, 256, 0, Vec::new(), Some("my_global"));
        registry.mark_freed(handle, 256);

        let found = registry.find_past_by_address_and_window(0x7010, u64::MAX - 1, u64::MAX);
        assert_eq!(found, Some(handle));
        assert_eq!(
            registry.record_snapshot(handle).resolved_symbol.as_deref(),
            Some("my_global")
        );
    }

    #[test]
    fn finalize_moves_leaks_to_past() {
        let registry = test_registry();
        let t0 = registry.now();
        let handle = registry.register_region(MemKind::Heap, 0x8000, 64, 0xA, Vec::new(), None);
        assert_eq!(registry.finalize_leaked(), 1);

        assert_eq!(registry.find_live_by_address(0x8000), None);
        let past = registry.find_past_by_address_and_window(0x8000, t0, registry.now());
        assert_eq!(past, Some(handle));
        assert_eq!(registry.finalize_leaked(), 0);
    }

    #[test]
    fn eager_bucket_arrays_in_online_mode() {
        let mut settings = ProfilerSettings::default();
        settings.max_threads = 4;
        settings.online_analysis = true;
        let registry = Registry::new(settings);
        let handle = registry.register_region(MemKind::Heap, 0x1000, 64, 0xA, Vec::new(), None);
        assert_eq!(registry.record_snapshot(handle).per_thread_blocks, vec![NIL; 4]);
    }
}
