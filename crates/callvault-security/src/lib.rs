//! Input hardening for everything that reaches callvault from outside the
//! process.
//!
//! - [`PathValidator`] confines user-supplied paths to a base directory.
//! - [`SafeDecoder`] tokenizes XML without ever resolving DTD-declared or
//!   external entities.

pub mod error;
mod path;
mod xml;

pub use error::{Error, Result};
pub use path::{MAX_PATH_LEN, PathValidator};
pub use xml::{Element, SafeDecoder, Token, unescape};
