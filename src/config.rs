//! Process-wide profiler settings.
//!
//! Settings are loaded once at init, from `MEMACCESS_*` environment
//! variables with built-in defaults. The interposition shim owns the
//! question of *when* to initialize; this module only answers *how the
//! profiler behaves* once running.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upper bound on the number of thread ranks the profiler will track.
/// Per-record bucket arrays are sized by `max_threads`, so this bounds
/// eager allocation in online-analysis mode.
pub const MAX_THREAD_CAP: usize = 1024;

/// Process-wide settings, fixed at profiler init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilerSettings {
    /// Emit extra diagnostics to stdout/logs
    pub verbose: bool,
    /// Eagerly allocate per-thread bucket arrays at registration
    pub online_analysis: bool,
    /// Sampling period, in samples per tick; used for access-frequency
    /// statistics in the final report
    pub sampling_rate: u64,
    /// Emit the per-object dump files at shutdown
    pub dump_all: bool,
    /// Number of thread ranks per-record bucket arrays are sized for
    pub max_threads: usize,
    /// Directory receiving all report files
    pub log_dir: PathBuf,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            verbose: false,
            online_analysis: true,
            sampling_rate: 10_000,
            dump_all: false,
            max_threads: default_max_threads(),
            log_dir: default_log_dir(),
        }
    }
}

impl ProfilerSettings {
    /// Load settings from `MEMACCESS_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            verbose: env_bool("MEMACCESS_VERBOSE").unwrap_or(defaults.verbose),
            online_analysis: env_bool("MEMACCESS_ONLINE_ANALYSIS")
                .unwrap_or(defaults.online_analysis),
            sampling_rate: env_u64("MEMACCESS_SAMPLING_RATE").unwrap_or(defaults.sampling_rate),
            dump_all: env_bool("MEMACCESS_DUMP_ALL").unwrap_or(defaults.dump_all),
            max_threads: env_u64("MEMACCESS_MAX_THREADS")
                .map(|n| (n as usize).clamp(1, MAX_THREAD_CAP))
                .unwrap_or(defaults.max_threads),
            log_dir: std::env::var_os("MEMACCESS_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
        }
    }
}

fn default_max_threads() -> usize {
    // Leave headroom for threads beyond the core count; short-lived
    // worker threads each consume a rank.
    (num_cpus::get() * 4).clamp(16, MAX_THREAD_CAP)
}

fn default_log_dir() -> PathBuf {
    let pid = unsafe { libc::getpid() };
    PathBuf::from(format!("memaccess_{pid}"))
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|v| parse_bool(&v))
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" on "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn defaults_are_sane() {
        let settings = ProfilerSettings::default();
        assert!(settings.max_threads >= 16);
        assert!(settings.max_threads <= MAX_THREAD_CAP);
        assert!(settings.sampling_rate > 0);
        assert!(!settings.dump_all);
    }
}
