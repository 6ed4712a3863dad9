//! Runtime memory-access profiling core.
//!
//! This crate tracks every live and past heap allocation with full
//! call-site provenance, enumerates globals and TLS objects from the
//! process's loaded images, attributes hardware memory-access samples
//! back to the allocation (or global/stack region) they touched, and
//! aggregates per-call-site statistics partitioned by memory-hierarchy
//! level and access kind.
//!
//! The crate is passive: a `malloc`/`free` interposition shim drives
//! the ingest API (`record_malloc`, `record_free`,
//! `update_buffer_address`), and a hardware sampling driver delivers
//! `Sample` batches through a [`sampling::SampleSource`] or the
//! lock-free staging queue. At process shutdown the host calls
//! [`Profiler::finalize`], which folds allocations into call sites and
//! writes the reports.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod arena;
pub mod callsites;
pub mod config;
pub mod error;
pub mod images;
pub mod index;
pub mod registry;
pub mod report;
pub mod sampling;
pub mod strings;
pub mod symbols;
pub mod types;

pub use config::ProfilerSettings;
pub use error::{ProfilerError, ProfilerResult};
pub use registry::Registry;
pub use sampling::{RecordGuard, SampleCollector, SampleSource};
pub use symbols::{DladdrResolver, SymbolResolver};
pub use types::{AccessKind, HitLevel, HitSource, MemBlockInfo, MemKind, RecordHandle, Sample};

use std::sync::{Arc, OnceLock};

static PROFILER: OnceLock<Profiler> = OnceLock::new();

/// Initialize the global profiler: set up the tracing subscriber, load
/// settings from the environment, enumerate globals and the stack, and
/// assign the calling thread its rank. Idempotent; later calls return
/// the same instance.
pub fn init() -> &'static Profiler {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .try_init();

    PROFILER.get_or_init(|| {
        let profiler = Profiler::new(ProfilerSettings::from_env());
        profiler.scan_process();
        profiler.thread_init();
        profiler
    })
}

/// The global profiler, if `init` has run.
pub fn global() -> Option<&'static Profiler> {
    PROFILER.get()
}

/// The profiler context: registry, sample collector and resolver,
/// created at init and torn down by `finalize`.
pub struct Profiler {
    registry: Arc<Registry>,
    collector: SampleCollector,
    resolver: Box<dyn SymbolResolver>,
}

impl Profiler {
    /// Build a standalone profiler. Most callers want [`init`]; tests
    /// and embedders construct their own with explicit settings.
    pub fn new(settings: ProfilerSettings) -> Self {
        let registry = Arc::new(Registry::new(settings));
        let collector = SampleCollector::new(Arc::clone(&registry));
        Self {
            registry,
            collector,
            resolver: Box::new(DladdrResolver),
        }
    }

    /// Replace the symbol resolution provider.
    pub fn set_resolver(&mut self, resolver: Box<dyn SymbolResolver>) {
        self.resolver = resolver;
    }

    /// Install the hardware sampler provider.
    pub fn set_sample_source(&self, source: Box<dyn SampleSource>) {
        self.collector.set_source(source);
    }

    /// The allocation registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The sample collector.
    pub fn collector(&self) -> &SampleCollector {
        &self.collector
    }

    /// Enumerate global/TLS variables and the stack range as
    /// pseudo-allocations. External failures are logged and skipped.
    pub fn scan_process(&self) {
        if let Err(err) = images::scan_images(&self.registry) {
            tracing::error!(error = %err, "global variable enumeration failed");
        }
        if let Err(err) = images::register_stack(&self.registry) {
            tracing::error!(error = %err, "stack registration failed");
        }
    }

    /// Assign the calling thread its rank. Called implicitly by the
    /// other entry points; interceptors may call it eagerly from their
    /// thread-start hook.
    pub fn thread_init(&self) -> u32 {
        sampling::current_thread_rank()
    }

    /// Record a fresh allocation. Fills `block.record_info` with the
    /// handle the interceptor must pass back on free. No-op when
    /// re-entered from within the recorder.
    pub fn record_malloc(&self, block: &mut MemBlockInfo, caller_ip: u64, call_stack: Vec<u64>) {
        let Some(_guard) = RecordGuard::acquire() else {
            return;
        };
        self.collector.collect_under_guard();
        let handle = self.registry.register_region(
            MemKind::Heap,
            block.u_ptr,
            block.size,
            caller_ip,
            call_stack,
            None,
        );
        block.record_info = Some(handle);
        self.collector.sampling_resume();
    }

    /// Record a free. `block.size` carries the buffer's size at free
    /// time. Blocks the recorder never saw (`record_info` empty) are
    /// ignored.
    pub fn record_free(&self, block: &mut MemBlockInfo) {
        let Some(handle) = block.record_info else {
            return;
        };
        let Some(_guard) = RecordGuard::acquire() else {
            return;
        };
        self.collector.collect_under_guard();
        self.registry.mark_freed(handle, block.size);
        self.collector.sampling_resume();
    }

    /// Record a realloc that moved the buffer from `old_addr` to
    /// `new_addr`.
    pub fn update_buffer_address(&self, block: &MemBlockInfo, old_addr: u64, new_addr: u64) {
        let Some(handle) = block.record_info else {
            return;
        };
        let Some(_guard) = RecordGuard::acquire() else {
            return;
        };
        self.collector.collect_under_guard();
        debug_assert_eq!(self.registry.record_snapshot(handle).start_addr, old_addr);
        self.registry.update_address(handle, new_addr);
        self.collector.sampling_resume();
    }

    /// Drain and attribute everything the sampler has buffered.
    pub fn collect_samples(&self) {
        self.collector.collect_samples();
    }

    /// Re-arm the sampler after a critical section.
    pub fn sampling_resume(&self) {
        self.collector.sampling_resume();
    }

    /// Shutdown: implicitly free leaked allocations, drain the last
    /// sample batch, aggregate call sites and write every report.
    /// Report failures are logged, never propagated.
    pub fn finalize(&self) {
        self.collector.collect_samples();
        let leaked = self.registry.finalize_leaked();
        if leaked > 0 {
            tracing::info!(leaked, "allocations were still live at shutdown");
        }

        let sites = callsites::aggregate(&self.registry);
        let reporter = report::Reporter::new(&self.registry, self.resolver.as_ref());
        if let Err(err) = reporter.write_all(&sites) {
            tracing::error!(error = %err, "failed to write reports");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init() as *const Profiler;
        let second = init() as *const Profiler;
        assert_eq!(first, second);
    }

    #[test]
    fn reentrant_ingest_is_a_noop() {
        let profiler = Profiler::new(ProfilerSettings {
            online_analysis: false,
            ..ProfilerSettings::default()
        });
        let _guard = RecordGuard::acquire().expect("guard is free");

        let mut block = MemBlockInfo {
            u_ptr: 0x1000,
            size: 64,
            record_info: None,
        };
        profiler.record_malloc(&mut block, 0xA, Vec::new());
        // The recorder was busy: nothing was registered.
        assert_eq!(block.record_info, None);
        assert_eq!(profiler.registry().find_live_by_address(0x1000), None);
    }
}
