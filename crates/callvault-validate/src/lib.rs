//! Repository integrity validation for callvault.
//!
//! A [`Validator`] runs five phases against a materialised repository:
//!
//! 1. **structure**: required files and directories, marker keys, and the
//!    format-version gate. An unsupported version aborts the run.
//! 2. **manifest**: `files.toml` lists every file exactly once, with
//!    well-formed hashes, positive sizes and safe relative paths.
//! 3. **checksum**: every recorded hash (and the manifest's own) is
//!    recomputed. Mismatches are reported, never repaired.
//! 4. **content**: record counts and attachment references are re-derived
//!    from the partitions; stored blobs are re-hashed.
//! 5. **consistency**: derived facts are checked against `summary.toml` and
//!    the attachment store; unreferenced blobs are orphan warnings.
//!
//! Findings come back as a [`Report`]; failures to validate at all come
//! back as [`Error`].

mod cache;
mod error;
mod metrics;
mod options;
mod phases;
mod report;
mod validator;

pub use cache::{CacheEntry, ValidationCache};
pub use error::{CancelReason, Error, Result};
pub use metrics::ValidationMetrics;
pub use options::{CriticalPolicy, DEFAULT_MAX_CONCURRENCY, ProgressFn, ValidateOptions};
pub use phases::Phase;
pub use report::{Report, Severity, Status, Violation, ViolationType};
pub use validator::Validator;
