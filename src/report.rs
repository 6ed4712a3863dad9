//! Report emission: buffer listing, call-site summaries, per-site page
//! heat tables, object dumps and the global counter summary.
//!
//! Everything lands under the settings' log directory. The call-site
//! summary is mirrored to stdout so a run leaves a trace even when the
//! log directory is never inspected.

use crate::callsites::CallSite;
use crate::error::{ProfilerError, ProfilerResult};
use crate::registry::Registry;
use crate::sampling;
use crate::symbols::SymbolResolver;
use crate::types::{AccessKind, AllocationRecord, MemCounters, MemKind, PAGE_SIZE};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Writes every report for one finished run.
pub struct Reporter<'a> {
    registry: &'a Registry,
    resolver: &'a dyn SymbolResolver,
}

/// One row of the machine-readable object dump.
#[derive(Debug, Serialize)]
struct ObjectRow {
    id: u32,
    address: String,
    size: usize,
    alloc_date: u64,
    free_date: u64,
    callstack: Vec<String>,
    callstack_offsets: Vec<String>,
    callsite_ip: String,
    callsite: String,
}

impl<'a> Reporter<'a> {
    /// A reporter for `registry`, resolving names through `resolver`.
    pub fn new(registry: &'a Registry, resolver: &'a dyn SymbolResolver) -> Self {
        Self { registry, resolver }
    }

    /// Emit every output: `buffers.log`, `call_sites.log` (+ stdout
    /// mirror), per-site counter and heat files, the object dumps when
    /// `dump_all` is set, and the global counter summary on stdout.
    pub fn write_all(&self, sites: &[CallSite]) -> ProfilerResult<()> {
        let settings = self.registry.settings();
        std::fs::create_dir_all(&settings.log_dir)
            .map_err(|_| ProfilerError::LogDir(settings.log_dir.display().to_string()))?;

        let records = self.registry.snapshot_all_records();
        self.write_buffer_list(&records)?;
        self.write_call_site_summary(sites)?;
        if settings.dump_all {
            self.write_object_summary(&records)?;
            self.write_object_summary_json(&records)?;
        }
        self.print_global_summary();
        tracing::info!(dir = %settings.log_dir.display(), "reports written");
        Ok(())
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.registry.settings().log_dir.join(name)
    }

    fn record_symbol(&self, record: &AllocationRecord) -> String {
        match &record.resolved_symbol {
            Some(symbol) => symbol.to_string(),
            None => self
                .resolver
                .resolve(record.caller_ip)
                .unwrap_or_else(|| String::from("??")),
        }
    }

    /// All allocations, live and past, one line each.
    fn write_buffer_list(&self, records: &[AllocationRecord]) -> ProfilerResult<()> {
        let file = File::create(self.log_path("buffers.log"))?;
        let mut out = BufWriter::new(file);
        for record in records {
            let stack = if record.call_stack.is_empty() {
                String::from("NULL")
            } else {
                join_hex(&record.call_stack[user_frames_start(record)..])
            };
            writeln!(
                out,
                "mem {}: addr={:#x} size={} kind={:?} alloc_date={} free_date={} callstack={} site={:#x} / {}",
                record.id,
                record.start_addr,
                record.current_size,
                record.kind,
                record.alloc_time,
                record.free_time,
                stack,
                record.caller_ip,
                self.record_symbol(record),
            )?;
        }
        Ok(())
    }

    /// `call_sites.log`, the stdout mirror, and the two per-site files.
    fn write_call_site_summary(&self, sites: &[CallSite]) -> ProfilerResult<()> {
        let file = File::create(self.log_path("call_sites.log"))?;
        let mut out = BufWriter::new(file);
        writeln!(
            out,
            "# call sites, busiest first - generated {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        println!("Summary of the call sites:");
        println!("--------------------------");
        for site in sites {
            if !site.has_accesses() {
                continue;
            }
            let read = site.counters(AccessKind::Read);
            let write = site.counters(AccessKind::Write);
            let avg_read = if read.total_count > 0 {
                read.total_weight as f64 / read.total_count as f64
            } else {
                0.0
            };
            let symbol = site
                .resolved_symbol
                .as_deref()
                .map(str::to_owned)
                .or_else(|| self.resolver.resolve(site.caller_ip))
                .unwrap_or_else(|| String::from("??"));
            let line = format!(
                "{}\t{} (size={}) - {} buffers. {} read access (total weight: {}, avg weight: {:.2}). {} wr_access",
                site.id,
                symbol,
                site.allocation_size,
                site.n_allocations,
                read.total_count,
                read.total_weight,
                avg_read,
                write.total_count,
            );
            writeln!(out, "{line}")?;
            println!("{line}");

            self.write_site_counters(site)?;
            if site.kind != MemKind::Stack {
                self.write_site_heat(site)?;
            }
        }
        Ok(())
    }

    /// `callsite_summary_<id>.dat`: the full counter dump for one site.
    fn write_site_counters(&self, site: &CallSite) -> ProfilerResult<()> {
        let path = self.log_path(&format!("callsite_summary_{}.dat", site.id));
        let mut out = BufWriter::new(File::create(path)?);
        write_counters(&mut out, site.counters(AccessKind::Read), AccessKind::Read)?;
        write_counters(&mut out, site.counters(AccessKind::Write), AccessKind::Write)?;
        Ok(())
    }

    /// `callsite_counters_<id>.dat`: rows are pages, columns are thread
    /// ranks, cells are read+write access counts.
    fn write_site_heat(&self, site: &CallSite) -> ProfilerResult<()> {
        let path = self.log_path(&format!("callsite_counters_{}.dat", site.id));
        let mut out = BufWriter::new(File::create(path)?);

        let n_threads = (sampling::thread_count() as usize)
            .max(1)
            .min(site.per_thread_blocks.len().max(1));
        let n_pages = site.allocation_size as u64 / PAGE_SIZE + 1;
        for page in 0..n_pages {
            for rank in 0..n_threads {
                let total: u64 = site
                    .per_thread_blocks
                    .get(rank)
                    .and_then(|blocks| blocks.iter().find(|b| b.page_index == page))
                    .map(|b| {
                        b.counters[AccessKind::Read.index()].total_count
                            + b.counters[AccessKind::Write.index()].total_count
                    })
                    .unwrap_or(0);
                write!(out, "\t{total}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// `all_memory_objects.dat`: tab-separated, one row per object.
    fn write_object_summary(&self, records: &[AllocationRecord]) -> ProfilerResult<()> {
        let file = File::create(self.log_path("all_memory_objects.dat"))?;
        let mut out = BufWriter::new(file);
        writeln!(
            out,
            "#object_id\taddress\tsize\tallocation_date\tdeallocation_date\tcallstack_rip\tcallstack_offsets\tcallsite_rip\tcallsite_symbol"
        )?;
        for record in records {
            let row = self.object_row(record);
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                row.id,
                row.address,
                row.size,
                row.alloc_date,
                row.free_date,
                join_or_null(&row.callstack),
                join_or_null(&row.callstack_offsets),
                row.callsite_ip,
                row.callsite,
            )?;
        }
        Ok(())
    }

    /// `all_memory_objects.json`: the same rows, serialized.
    fn write_object_summary_json(&self, records: &[AllocationRecord]) -> ProfilerResult<()> {
        let rows: Vec<ObjectRow> = records.iter().map(|r| self.object_row(r)).collect();
        let file = File::create(self.log_path("all_memory_objects.json"))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &rows)
            .map_err(|e| ProfilerError::Io(e.into()))?;
        Ok(())
    }

    fn object_row(&self, record: &AllocationRecord) -> ObjectRow {
        let frames = &record.call_stack[user_frames_start(record)..];
        let callstack: Vec<String> = frames.iter().map(|ip| format!("{ip:#x}")).collect();
        let callstack_offsets: Vec<String> = frames
            .iter()
            .map(|ip| match self.resolver.image_of(*ip) {
                Some(image) => format!("{}:{}", image.path, ip.saturating_sub(image.base)),
                None => String::from("?:0"),
            })
            .collect();
        ObjectRow {
            id: record.id,
            address: format!("{:#x}", record.start_addr),
            size: record.current_size,
            alloc_date: record.alloc_time,
            free_date: record.free_time,
            callstack,
            callstack_offsets,
            callsite_ip: format!("{:#x}", record.caller_ip),
            callsite: self.record_symbol(record),
        }
    }

    /// Whole-run counters and attribution statistics, on stdout.
    fn print_global_summary(&self) {
        let settings = self.registry.settings();
        println!("---------------------------------");
        println!("      MEMORY ACCESS PROFILE");
        println!("---------------------------------");
        let mut stdout = std::io::stdout().lock();
        for access in [AccessKind::Read, AccessKind::Write] {
            let counters = self.registry.global_counters(access);
            let _ = write_counters(&mut stdout, &counters, access);
            if counters.total_count > 0 && settings.sampling_rate > 0 {
                // Mean interval between sampled accesses, in ticks.
                let interval =
                    self.registry.now() / settings.sampling_rate / counters.total_count;
                let _ = writeln!(stdout, "# Mean access interval  : \t {interval} ticks");
            }
        }
        let _ = writeln!(
            stdout,
            "# Unattributed samples : \t {}",
            self.registry.unattributed_count()
        );
    }
}

/// Index of the first user frame of a captured stack: heap stacks carry
/// the interceptor's own frames 0..3, pseudo-allocations do not.
fn user_frames_start(record: &AllocationRecord) -> usize {
    if record.kind == MemKind::Heap {
        record.call_stack.len().min(3)
    } else {
        0
    }
}

fn join_hex(frames: &[u64]) -> String {
    frames
        .iter()
        .map(|ip| format!("{ip:#x}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn join_or_null(parts: &[String]) -> String {
    if parts.is_empty() {
        String::from("NULL")
    } else {
        parts.join(",")
    }
}

/// The `MemCounters` dump shared by per-site summaries and the global
/// report: totals, then one line per non-empty (level, hit/miss) cell.
fn write_counters(
    out: &mut dyn Write,
    counters: &MemCounters,
    access: AccessKind,
) -> std::io::Result<()> {
    let what = match access {
        AccessKind::Read => "read",
        AccessKind::Write => "write",
    };
    writeln!(out, "# --------------------------------------")?;
    writeln!(out, "# Summary of all the {what} memory access:")?;
    writeln!(out, "# Total count          : \t {}", counters.total_count)?;
    writeln!(out, "# Total weight         : \t {}", counters.total_weight)?;
    if counters.na_miss_count > 0 {
        writeln!(
            out,
            "# N/A                  : \t {} ({:.3} %)",
            counters.na_miss_count,
            percent(counters.na_miss_count, counters.total_count)
        )?;
    }
    for missed in [false, true] {
        for level in crate::types::HitLevel::ALL {
            let cell = counters.cell(crate::types::HitSource { level, missed });
            if cell.count == 0 {
                continue;
            }
            writeln!(
                out,
                "# {} {}\t: {} ({:.3} %) \tmin: {} cycles\tmax: {} cycles\t avg: {} cycles\ttotal weight: {} ({:.3} %)",
                level.label(),
                if missed { "Miss" } else { "Hit" },
                cell.count,
                percent(cell.count, counters.total_count),
                cell.min_weight,
                cell.max_weight,
                cell.avg_weight(),
                cell.sum_weight,
                percent(cell.sum_weight, counters.total_weight),
            )?;
        }
        if !missed {
            writeln!(out)?;
        }
    }
    Ok(())
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}
