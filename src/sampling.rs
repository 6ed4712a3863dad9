//! Sample collection: thread ranks, the recursion guard, and the
//! attribution pipeline between the hardware sampler and the registry.
//!
//! The collector is re-entered from signal-adjacent contexts (hardware
//! event overflow) and from inside the interceptor, so two protections
//! apply everywhere here: a thread-local recursion guard that turns
//! re-entry into a no-op, and a bounded lock-free staging queue so a
//! signal context can hand samples off without taking any lock.

use crate::registry::Registry;
use crate::types::Sample;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide thread rank counter. Ranks are dense, start at zero and
/// are never recycled.
static NEXT_THREAD_RANK: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static THREAD_RANK: Cell<u32> = const { Cell::new(u32::MAX) };
    static IS_RECORD_SAFE: Cell<bool> = const { Cell::new(true) };
}

/// Rank of the calling thread, assigned on first call.
pub fn current_thread_rank() -> u32 {
    THREAD_RANK.with(|cell| {
        let cached = cell.get();
        if cached != u32::MAX {
            return cached;
        }
        let rank = NEXT_THREAD_RANK.fetch_add(1, Ordering::Relaxed);
        cell.set(rank);
        rank
    })
}

/// Number of thread ranks handed out so far.
pub fn thread_count() -> u32 {
    NEXT_THREAD_RANK.load(Ordering::Relaxed)
}

/// RAII recursion guard for the recorder.
///
/// While a guard is held on a thread, any further `acquire` on the same
/// thread returns `None`: re-entry into the recorder from within itself
/// (the attributor touching memory, the arena growing a chunk) must be
/// a no-op.
pub struct RecordGuard {
    // Guards are tied to the thread that acquired them.
    _not_send: PhantomData<*const ()>,
}

impl RecordGuard {
    /// Claim the calling thread's recorder, or `None` if it is already
    /// claimed further up the stack.
    pub fn acquire() -> Option<Self> {
        IS_RECORD_SAFE.with(|safe| {
            if !safe.get() {
                return None;
            }
            safe.set(false);
            Some(RecordGuard {
                _not_send: PhantomData,
            })
        })
    }

    /// True if the calling thread's recorder is free.
    pub fn is_record_safe() -> bool {
        IS_RECORD_SAFE.with(Cell::get)
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        IS_RECORD_SAFE.with(|safe| {
            assert!(!safe.get(), "recursion guard released twice");
            safe.set(true);
        });
    }
}

/// The opaque hardware-sampler provider.
///
/// `flush` delivers every sample buffered since the last call into the
/// sink; `resume` re-arms the hardware after the core leaves a critical
/// section.
pub trait SampleSource: Send {
    /// Drain buffered samples into `sink`.
    fn flush(&mut self, sink: &mut dyn FnMut(Sample));

    /// Re-arm sampling after a pause. Default: nothing to do.
    fn resume(&mut self) {}
}

/// Bridges the sampler to the registry: drains sample batches and
/// attributes each sample to the allocation it touched.
pub struct SampleCollector {
    registry: Arc<Registry>,
    staged: ArrayQueue<Sample>,
    staged_dropped: AtomicU64,
    attributed: AtomicU64,
    source: Mutex<Option<Box<dyn SampleSource>>>,
}

/// Capacity of the signal-context staging queue.
const STAGING_CAPACITY: usize = 4096;

impl SampleCollector {
    /// Create a collector feeding `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            staged: ArrayQueue::new(STAGING_CAPACITY),
            staged_dropped: AtomicU64::new(0),
            attributed: AtomicU64::new(0),
            source: Mutex::new(None),
        }
    }

    /// Install the hardware sampler provider.
    pub fn set_source(&self, source: Box<dyn SampleSource>) {
        *self.source.lock() = Some(source);
    }

    /// Hand off a sample from a signal context. Lock-free and
    /// allocation-free; a full queue drops the sample (counted).
    pub fn stage(&self, sample: Sample) {
        if self.staged.push(sample).is_err() {
            self.staged_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Collect and attribute everything pending: the staging queue
    /// first, then a flush of the sampler itself. No-op when re-entered
    /// from within the recorder.
    pub fn collect_samples(&self) {
        let Some(_guard) = RecordGuard::acquire() else {
            return;
        };
        self.collect_under_guard();
    }

    /// As `collect_samples`, for callers already holding the thread's
    /// recursion guard (the interceptor entry points).
    pub(crate) fn collect_under_guard(&self) {
        while let Some(sample) = self.staged.pop() {
            self.attribute(&sample);
        }
        // The source lock is independent of the registry mutex and is
        // only contended by concurrent collectors.
        let mut source = self.source.lock();
        if let Some(source) = source.as_mut() {
            source.flush(&mut |sample| self.attribute(&sample));
        }
    }

    /// Signal the sampler to re-arm after a critical section.
    pub fn sampling_resume(&self) {
        if let Some(source) = self.source.lock().as_mut() {
            source.resume();
        }
    }

    /// Samples successfully charged to an allocation.
    pub fn attributed_count(&self) -> u64 {
        self.attributed.load(Ordering::Relaxed)
    }

    /// Samples lost to a full staging queue.
    pub fn staged_dropped_count(&self) -> u64 {
        self.staged_dropped.load(Ordering::Relaxed)
    }

    fn attribute(&self, sample: &Sample) {
        if self.registry.attribute_sample(sample).is_some() {
            self.attributed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.registry.count_unattributed();
            if self.registry.settings().verbose {
                tracing::debug!(
                    addr = format_args!("{:#x}", sample.addr),
                    timestamp = sample.timestamp,
                    "sample matched no live or past allocation"
                );
            }
        }
    }
}
