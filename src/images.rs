//! Enumeration of global and TLS variables from the process's loaded
//! binary images, plus stack-range registration.
//!
//! `/proc/self/maps` is parsed and grouped by backing file; each file's
//! ELF symbol tables are then scanned for global objects, which are
//! registered as pseudo-allocations with `alloc_time = 0` so hardware
//! samples landing in them attribute to a named variable instead of
//! being dropped.

use crate::error::{ProfilerError, ProfilerResult};
use crate::registry::Registry;
use crate::types::MemKind;
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Fallback stack range used when `/proc/self/maps` carries no
/// `[stack]` entry (observed under some sandboxes). Covers the
/// canonical high end of the user address space.
const FALLBACK_STACK_RANGE: (u64, u64) = (0x7fa0_0000_0000, 0x7fff_ffff_ffff);

/// One contiguous mapping of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsRange {
    /// First mapped address
    pub start: u64,
    /// One past the last mapped address
    pub end: u64,
    /// Permission string, e.g. `r-xp`
    pub perms: String,
    /// Offset of the mapping within the file
    pub offset: u64,
}

/// All mappings sharing one backing path.
#[derive(Debug, Clone)]
pub struct MapsFile {
    /// Backing path; `[stack]`-style pseudo paths included
    pub path: String,
    /// Mapped ranges, deduplicated
    pub ranges: Vec<MapsRange>,
}

impl MapsFile {
    /// Lowest mapped address of the file. Symbol runtime addresses are
    /// computed relative to this base.
    pub fn base_address(&self) -> u64 {
        self.ranges.iter().map(|r| r.start).min().unwrap_or(0)
    }
}

/// Counters describing one scan pass.
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    /// Files whose symbol tables were read
    pub images_scanned: usize,
    /// Pseudo-files and unreadable files skipped
    pub files_skipped: usize,
    /// Global objects registered
    pub globals_registered: usize,
    /// TLS objects registered
    pub tls_registered: usize,
}

/// Parse one `/proc/self/maps` line:
/// `start-end perms offset dev inode [path]`.
fn parse_maps_line(line: &str) -> Option<(MapsRange, Option<String>)> {
    let mut fields = line.split_whitespace();
    let addresses = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(str::to_owned);

    let (start, end) = addresses.split_once('-')?;
    let range = MapsRange {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms: perms.to_owned(),
        offset: u64::from_str_radix(offset, 16).ok()?,
    };
    Some((range, path))
}

/// Group maps content by backing path. Anonymous mappings are dropped;
/// a range already seen for a file (same bounds, perms and offset) is
/// not duplicated.
pub fn group_maps_by_file(content: &str) -> Vec<MapsFile> {
    let mut files: Vec<MapsFile> = Vec::new();
    for line in content.lines() {
        let Some((range, Some(path))) = parse_maps_line(line) else {
            continue;
        };
        match files.iter_mut().find(|f| f.path == path) {
            Some(file) => {
                if !file.ranges.contains(&range) {
                    file.ranges.push(range);
                }
            }
            None => files.push(MapsFile {
                path,
                ranges: vec![range],
            }),
        }
    }
    files
}

/// Scan every mapped image and register its global/TLS objects as
/// pseudo-allocations. Unreadable files are skipped, not fatal; only a
/// missing `/proc/self/maps` aborts the scan.
pub fn scan_images(registry: &Registry) -> ProfilerResult<ScanStats> {
    let content = fs::read_to_string("/proc/self/maps")?;
    let mut stats = ScanStats::default();
    for file in group_maps_by_file(&content) {
        scan_one_image(registry, &file, &mut stats);
    }
    tracing::info!(
        images = stats.images_scanned,
        skipped = stats.files_skipped,
        globals = stats.globals_registered,
        tls = stats.tls_registered,
        "image scan complete"
    );
    Ok(stats)
}

fn scan_one_image(registry: &Registry, file: &MapsFile, stats: &mut ScanStats) {
    // [stack], [heap], [vdso] and friends have no backing file.
    if !file.path.starts_with('/') {
        stats.files_skipped += 1;
        return;
    }
    let symbols = match read_global_objects(Path::new(&file.path)) {
        Ok(symbols) => symbols,
        Err(err) => {
            tracing::warn!(path = %file.path, error = %err, "skipping unreadable image");
            stats.files_skipped += 1;
            return;
        }
    };

    stats.images_scanned += 1;
    let base = file.base_address();
    if registry.settings().verbose {
        tracing::debug!(path = %file.path, base = format_args!("{base:#x}"), "exploring image");
    }
    for symbol in symbols {
        let kind = if symbol.is_tls {
            stats.tls_registered += 1;
            MemKind::Tls
        } else {
            stats.globals_registered += 1;
            MemKind::Global
        };
        registry.register_region(
            kind,
            symbol.value + base,
            symbol.size as usize,
            0,
            Vec::new(),
            Some(&symbol.name),
        );
    }
}

/// A global object found in a symbol table.
struct GlobalObject {
    name: String,
    value: u64,
    size: u64,
    is_tls: bool,
}

/// Read the symbol tables of one ELF image and keep symbols of binding
/// GLOBAL, type OBJECT or TLS, with non-zero size. A symbol present in
/// both `.symtab` and `.dynsym` is reported once.
fn read_global_objects(path: &Path) -> ProfilerResult<Vec<GlobalObject>> {
    let file = fs::File::open(path)?;
    let data = unsafe { memmap2::Mmap::map(&file)? };
    let image = object::File::parse(&*data).map_err(|e| ProfilerError::Elf {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut seen: HashSet<(String, u64)> = HashSet::new();
    let mut out = Vec::new();
    for symbol in image.symbols().chain(image.dynamic_symbols()) {
        if symbol.size() == 0 || !symbol.is_global() {
            continue;
        }
        let is_tls = match symbol.kind() {
            SymbolKind::Data => false,
            SymbolKind::Tls => true,
            _ => continue,
        };
        let Ok(raw_name) = symbol.name() else {
            continue;
        };
        if raw_name.is_empty() {
            continue;
        }
        if !seen.insert((raw_name.to_owned(), symbol.address())) {
            continue;
        }
        out.push(GlobalObject {
            name: rustc_demangle::demangle(raw_name).to_string(),
            value: symbol.address(),
            size: symbol.size(),
            is_tls,
        });
    }
    Ok(out)
}

/// Register the thread's stack range as a single pseudo-allocation.
/// The range comes from the maps `[stack]` entry; when that entry is
/// missing a conservative high-address fallback is used.
pub fn register_stack(registry: &Registry) -> ProfilerResult<()> {
    let content = fs::read_to_string("/proc/self/maps")?;
    let (start, end) = stack_range(&content).unwrap_or_else(|| {
        tracing::warn!("no [stack] entry in maps; registering fallback stack range");
        FALLBACK_STACK_RANGE
    });
    tracing::debug!(
        start = format_args!("{start:#x}"),
        end = format_args!("{end:#x}"),
        "registering stack range"
    );
    registry.register_region(
        MemKind::Stack,
        start,
        (end - start) as usize,
        0,
        Vec::new(),
        Some("[stack]"),
    );
    Ok(())
}

/// The `[stack]` entry of a maps listing, if present.
fn stack_range(content: &str) -> Option<(u64, u64)> {
    content.lines().find_map(|line| {
        let (range, path) = parse_maps_line(line)?;
        (path.as_deref() == Some("[stack]")).then_some((range.start, range.end))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfilerSettings;

    const SAMPLE_MAPS: &str = "\
55d0f1a00000-55d0f1a08000 r--p 00000000 fd:01 1573000 /usr/bin/cat
55d0f1a08000-55d0f1a0d000 r-xp 00008000 fd:01 1573000 /usr/bin/cat
7f5c3d400000-7f5c3d428000 r--p 00000000 fd:01 1573245 /usr/lib/x86_64-linux-gnu/libc.so.6
7f5c3d428000-7f5c3d5bd000 r-xp 00028000 fd:01 1573245 /usr/lib/x86_64-linux-gnu/libc.so.6
7f5c3d6e0000-7f5c3d6e2000 rw-p 00000000 00:00 0
7ffd1c0c0000-7ffd1c0e1000 rw-p 00000000 00:00 0 [stack]
7ffd1c1a4000-7ffd1c1a8000 r--p 00000000 00:00 0 [vvar]
";

    #[test]
    fn maps_lines_parse() {
        let (range, path) =
            parse_maps_line("55d0f1a00000-55d0f1a08000 r--p 00000000 fd:01 1573000 /usr/bin/cat")
                .expect("line parses");
        assert_eq!(range.start, 0x55d0f1a00000);
        assert_eq!(range.end, 0x55d0f1a08000);
        assert_eq!(range.perms, "r--p");
        assert_eq!(range.offset, 0);
        assert_eq!(path.as_deref(), Some("/usr/bin/cat"));

        // Anonymous mapping: parses, no path.
        let (_, path) =
            parse_maps_line("7f5c3d6e0000-7f5c3d6e2000 rw-p 00000000 00:00 0").expect("parses");
        assert_eq!(path, None);

        assert!(parse_maps_line("garbage").is_none());
        assert!(parse_maps_line("").is_none());
    }

    #[test]
    fn grouping_merges_ranges_per_file() {
        let files = group_maps_by_file(SAMPLE_MAPS);
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/usr/bin/cat",
                "/usr/lib/x86_64-linux-gnu/libc.so.6",
                "[stack]",
                "[vvar]"
            ]
        );

        let libc = &files[1];
        assert_eq!(libc.ranges.len(), 2);
        assert_eq!(libc.base_address(), 0x7f5c3d400000);
    }

    #[test]
    fn duplicate_ranges_collapse() {
        let doubled = format!("{SAMPLE_MAPS}{SAMPLE_MAPS}");
        let files = group_maps_by_file(&doubled);
        let cat = files.iter().find(|f| f.path == "/usr/bin/cat").unwrap();
        assert_eq!(cat.ranges.len(), 2);
    }

    #[test]
    fn stack_entry_is_found() {
        assert_eq!(
            stack_range(SAMPLE_MAPS),
            Some((0x7ffd1c0c0000, 0x7ffd1c0e1000))
        );
        assert_eq!(stack_range("no stack here"), None);
    }

    #[test]
    fn scanning_the_running_process_succeeds() {
        let registry = Registry::new(ProfilerSettings {
            online_analysis: false,
            ..ProfilerSettings::default()
        });
        let stats = scan_images(&registry).expect("maps must be readable");
        // At minimum the test binary itself is a scannable image.
        assert!(stats.images_scanned >= 1);

        register_stack(&registry).expect("stack registration");
    }
}
