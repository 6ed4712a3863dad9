//! End-to-end profiler lifecycle tests.
//!
//! Drives the full pipeline through the public surface: interceptor
//! ingest, sample staging, shutdown aggregation and report emission.

use memaccess_rs::{
    AccessKind, HitLevel, HitSource, MemBlockInfo, MemKind, Profiler, ProfilerSettings, Sample,
};
use std::sync::Arc;

fn profiler_in(dir: &std::path::Path) -> Profiler {
    Profiler::new(ProfilerSettings {
        max_threads: 8,
        online_analysis: true,
        dump_all: true,
        log_dir: dir.to_path_buf(),
        ..ProfilerSettings::default()
    })
}

fn read_sample(addr: u64, weight: u64, profiler: &Profiler) -> Sample {
    let now = profiler.registry().now();
    Sample {
        addr,
        timestamp: now,
        hit: Some(HitSource {
            level: HitLevel::L2,
            missed: false,
        }),
        weight,
        access: AccessKind::Read,
        thread_rank: 0,
        window_start: now.saturating_sub(1_000_000),
        window_stop: now + 1_000_000,
    }
}

#[test]
fn malloc_sample_free_report_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let profiler = profiler_in(dir.path());

    // Allocation arrives from the interceptor with its captured stack.
    let mut block = MemBlockInfo {
        u_ptr: 0x50_0000,
        size: 4096,
        record_info: None,
    };
    let stack = vec![0xF0u64, 0xF1, 0xF2, 0x1234, 0x5678];
    profiler.record_malloc(&mut block, 0x1234, stack);
    let handle = block.record_info.expect("record_malloc fills the slot");

    // Hardware samples land while the buffer is live...
    profiler.collector().stage(read_sample(0x50_0010, 40, &profiler));
    profiler.collect_samples();

    // ...and keep attributing after the free, through the past index.
    profiler.record_free(&mut block);
    profiler.collector().stage(read_sample(0x50_0020, 10, &profiler));
    profiler.collect_samples();
    assert_eq!(profiler.collector().attributed_count(), 2);

    let record = profiler.registry().record_snapshot(handle);
    assert_eq!(record.kind, MemKind::Heap);
    assert!(record.is_freed());

    profiler.finalize();

    let call_sites = std::fs::read_to_string(dir.path().join("call_sites.log")).unwrap();
    assert!(call_sites.contains("(size=4096) - 1 buffers. 2 read access"));
    assert!(dir.path().join("buffers.log").exists());
    assert!(dir.path().join("all_memory_objects.dat").exists());
    assert!(dir.path().join("all_memory_objects.json").exists());
    assert!(dir.path().join("callsite_summary_1.dat").exists());
    assert!(dir.path().join("callsite_counters_1.dat").exists());
}

#[test]
fn realloc_move_keeps_provenance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let profiler = profiler_in(dir.path());

    let mut block = MemBlockInfo {
        u_ptr: 0x60_0000,
        size: 16,
        record_info: None,
    };
    profiler.record_malloc(&mut block, 0xAA, Vec::new());
    let handle = block.record_info.unwrap();

    // realloc moved the buffer.
    block.u_ptr = 0x61_0000;
    profiler.update_buffer_address(&block, 0x60_0000, 0x61_0000);

    let registry = profiler.registry();
    assert_eq!(registry.find_live_by_address(0x60_0008), None);
    assert_eq!(registry.find_live_by_address(0x61_0008), Some(handle));

    // Accesses to the new placement attribute to the same record.
    profiler.collector().stage(read_sample(0x61_0004, 7, &profiler));
    profiler.collect_samples();
    assert_eq!(profiler.collector().attributed_count(), 1);
}

#[test]
fn leaked_allocations_are_implicitly_freed_at_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let profiler = profiler_in(dir.path());

    let mut block = MemBlockInfo {
        u_ptr: 0x70_0000,
        size: 256,
        record_info: None,
    };
    profiler.record_malloc(&mut block, 0xBB, Vec::new());
    let handle = block.record_info.unwrap();

    profiler.finalize();

    let record = profiler.registry().record_snapshot(handle);
    assert!(record.is_freed(), "finalize must stamp a free date");
    assert!(record.alloc_time <= record.free_time);
}

#[test]
fn concurrent_ingest_from_many_threads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let profiler = Arc::new(profiler_in(dir.path()));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let profiler = Arc::clone(&profiler);
            std::thread::spawn(move || {
                profiler.thread_init();
                for i in 0..50u64 {
                    let addr = 0x1000_0000 + t * 0x10_0000 + i * 0x1000;
                    let mut block = MemBlockInfo {
                        u_ptr: addr,
                        size: 512,
                        record_info: None,
                    };
                    profiler.record_malloc(&mut block, 0xC0 + t, Vec::new());
                    assert!(block.record_info.is_some());
                    if i % 2 == 0 {
                        profiler.record_free(&mut block);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    // Half of each thread's allocations are still live and findable.
    for t in 0..8u64 {
        let addr = 0x1000_0000 + t * 0x10_0000 + 0x1000; // i == 1, never freed
        assert!(profiler.registry().find_live_by_address(addr + 8).is_some());
    }

    profiler.finalize();
    assert!(dir.path().join("call_sites.log").exists());
}

#[test]
fn unattributed_samples_are_counted_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let profiler = profiler_in(dir.path());

    profiler.collector().stage(read_sample(0xdead_0000, 1, &profiler));
    profiler.collect_samples();

    assert_eq!(profiler.collector().attributed_count(), 0);
    assert_eq!(profiler.registry().unattributed_count(), 1);
}
