//! Core types for the callvault archive.
//!
//! Record types, the [`Entry`](entry::Entry) capability trait, and the
//! generic [`Coalescer`](coalesce::Coalescer) that deduplicates them. This
//! crate knows nothing about the on-disk repository layout.

pub mod cancel;
pub mod coalesce;
pub mod entry;
pub mod error;
pub mod record;

pub use cancel::CancelToken;
pub use coalesce::{Coalescer, Summary};
pub use entry::{Entry, EntityKind};
pub use error::{Error, Result};
