//! Global symbol-string interner.
//!
//! Symbol names repeat heavily (every allocation from the same call site
//! resolves to the same function, every global from the same library
//! shares path-like prefixes), so records hold `Arc<str>` handles into a
//! process-wide pool instead of owned `String`s. The pool owns every
//! interned string for the lifetime of the process.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

static POOL: OnceLock<StringPool> = OnceLock::new();

/// Intern `s` in the global pool and return a shared handle.
pub fn intern(s: &str) -> Arc<str> {
    global_pool().intern(s)
}

/// Snapshot of the global pool's usage counters.
pub fn pool_stats() -> StringPoolStats {
    global_pool().stats()
}

fn global_pool() -> &'static StringPool {
    POOL.get_or_init(StringPool::new)
}

/// Usage counters for an interner instance.
#[derive(Debug, Clone)]
pub struct StringPoolStats {
    /// Unique strings currently held
    pub unique_strings: usize,
    /// Total intern calls
    pub intern_operations: u64,
    /// Calls satisfied by an existing entry
    pub cache_hits: u64,
}

/// A concurrent string interner returning `Arc<str>` handles.
pub struct StringPool {
    strings: DashMap<Arc<str>, ()>,
    intern_count: AtomicU64,
    hit_count: AtomicU64,
}

impl StringPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
            intern_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
        }
    }

    /// Return the pooled handle for `s`, inserting it on first sight.
    pub fn intern(&self, s: &str) -> Arc<str> {
        self.intern_count.fetch_add(1, Ordering::Relaxed);
        if let Some(entry) = self.strings.get(s) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return entry.key().clone();
        }
        let handle: Arc<str> = Arc::from(s);
        // A racing insert of the same string leaves one extra Arc alive;
        // both handles compare equal, which is all callers rely on.
        self.strings.insert(handle.clone(), ());
        handle
    }

    /// Snapshot the pool's counters.
    pub fn stats(&self) -> StringPoolStats {
        StringPoolStats {
            unique_strings: self.strings.len(),
            intern_operations: self.intern_count.load(Ordering::Relaxed),
            cache_hits: self.hit_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}
