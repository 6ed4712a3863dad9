//! Error types for the profiler core.
//!
//! External resource failures (maps, ELF, log files) are recoverable:
//! they are reported once and the affected resource is skipped.
//! Programming invariant violations are not represented here; those
//! panic at the violation site.

use thiserror::Error;

/// Error type for profiler operations that touch external resources.
#[derive(Debug, Error)]
pub enum ProfilerError {
    /// I/O failure on a file or OS surface
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A mapped file could not be read as an ELF image
    #[error("ELF parse error in {path}: {reason}")]
    Elf {
        /// Path of the offending image
        path: String,
        /// Parser diagnostic
        reason: String,
    },

    /// The log directory could not be created or written
    #[error("log directory {0} is unusable")]
    LogDir(String),
}

/// Result type for profiler operations.
pub type ProfilerResult<T> = Result<T, ProfilerError>;
