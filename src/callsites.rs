//! Call-site aggregation: collapse allocations sharing a call-stack
//! signature into one record, cumulate their counters, rank.
//!
//! Runs at shutdown, after every allocation has been moved to the past
//! collection, with no other thread expected to be active.

use crate::registry::Registry;
use crate::types::{
    AccessKind, AllocationRecord, MemCounters, MemKind, PageBucket, ACCESS_KIND_COUNT,
};
use crate::arena::NIL;
use std::collections::HashMap;
use std::sync::Arc;

/// Frames 0..3 of a captured stack belong to the interceptor itself and
/// are skipped when fingerprinting.
const INTERCEPTOR_FRAMES: usize = 3;

/// One call site: the collapse of every allocation sharing a
/// fingerprint.
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Fresh id, assigned in materialization order starting at 1
    pub id: u32,
    /// Region kind of the collapsed allocations
    pub kind: MemKind,
    /// Program counter of the allocation site
    pub caller_ip: u64,
    /// Symbol of the first collapsed record, if it was resolved
    pub resolved_symbol: Option<Arc<str>>,
    /// Full captured stack of the first collapsed record
    pub call_stack: Vec<u64>,
    /// Allocation size shared by every collapsed record
    pub allocation_size: usize,
    /// Number of allocation records collapsed into this site
    pub n_allocations: u32,
    /// Flat counters cumulated across all records, threads and pages
    pub cumulated: [MemCounters; ACCESS_KIND_COUNT],
    /// Per-thread page buckets cumulated across records, for heat-map
    /// output; inner vectors are sorted by page index
    pub per_thread_blocks: Vec<Vec<PageBucket>>,
}

impl CallSite {
    /// Cumulated counters for one access kind.
    pub fn counters(&self, access: AccessKind) -> &MemCounters {
        &self.cumulated[access.index()]
    }

    /// True if any read or write was ever attributed here.
    pub fn has_accesses(&self) -> bool {
        !self.counters(AccessKind::Read).is_empty() || !self.counters(AccessKind::Write).is_empty()
    }
}

/// The dedup key: allocation size plus the stack above the
/// interceptor's own frames, or the caller IP when no stack was
/// captured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Fingerprint {
    Stack(usize, Vec<u64>),
    Caller(usize, u64),
}

impl Fingerprint {
    fn of(record: &AllocationRecord) -> Self {
        if record.call_stack.is_empty() {
            Fingerprint::Caller(record.initial_size, record.caller_ip)
        } else {
            let suffix = record
                .call_stack
                .get(INTERCEPTOR_FRAMES..)
                .unwrap_or(&[])
                .to_vec();
            Fingerprint::Stack(record.initial_size, suffix)
        }
    }
}

/// Walk every record in the registry, collapse records by fingerprint,
/// fold their counters, and return the sites ranked by descending
/// cumulative read weight (ties: descending write weight, then
/// materialization order).
///
/// Records that never received a bucket array (lazy mode, never
/// sampled) are not folded; they cannot contribute counters.
pub fn aggregate(registry: &Registry) -> Vec<CallSite> {
    let inner = registry.lock();
    let mut sites: Vec<CallSite> = Vec::new();
    let mut by_fingerprint: HashMap<Fingerprint, usize> = HashMap::new();

    for record in inner.records.iter() {
        if record.per_thread_blocks.is_empty() {
            continue;
        }
        let fingerprint = Fingerprint::of(record);
        let slot = *by_fingerprint.entry(fingerprint).or_insert_with(|| {
            sites.push(CallSite {
                id: sites.len() as u32 + 1,
                kind: record.kind,
                caller_ip: record.caller_ip,
                resolved_symbol: record.resolved_symbol.clone(),
                call_stack: record.call_stack.clone(),
                allocation_size: record.initial_size,
                n_allocations: 0,
                cumulated: [MemCounters::default(), MemCounters::default()],
                per_thread_blocks: Vec::new(),
            });
            sites.len() - 1
        });

        let site = &mut sites[slot];
        site.n_allocations += 1;
        if site.per_thread_blocks.len() < record.per_thread_blocks.len() {
            site.per_thread_blocks
                .resize(record.per_thread_blocks.len(), Vec::new());
        }

        for (rank, head) in record.per_thread_blocks.iter().enumerate() {
            let mut cursor = *head;
            while cursor != NIL {
                let bucket = inner.buckets.get(cursor);
                fold_bucket(&mut site.per_thread_blocks[rank], bucket);
                for access in 0..ACCESS_KIND_COUNT {
                    site.cumulated[access].merge(&bucket.counters[access]);
                }
                cursor = bucket.next;
            }
        }
    }
    drop(inner);

    rank_sites(&mut sites);
    tracing::debug!(sites = sites.len(), "call-site aggregation complete");
    sites
}

/// Merge `bucket` into the site-side bucket with the same page index,
/// inserting a new one in page order if needed.
fn fold_bucket(blocks: &mut Vec<PageBucket>, bucket: &PageBucket) {
    match blocks.binary_search_by_key(&bucket.page_index, |b| b.page_index) {
        Ok(pos) => {
            for access in 0..ACCESS_KIND_COUNT {
                blocks[pos].counters[access].merge(&bucket.counters[access]);
            }
        }
        Err(pos) => {
            let mut fresh = bucket.clone();
            fresh.next = NIL;
            blocks.insert(pos, fresh);
        }
    }
}

/// Consistent report ordering: heaviest read traffic first.
fn rank_sites(sites: &mut [CallSite]) {
    sites.sort_by(|a, b| {
        b.counters(AccessKind::Read)
            .total_weight
            .cmp(&a.counters(AccessKind::Read).total_weight)
            .then_with(|| {
                b.counters(AccessKind::Write)
                    .total_weight
                    .cmp(&a.counters(AccessKind::Write).total_weight)
            })
    });
}
