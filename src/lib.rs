//! MementoMap: compact, sorted summaries of web archive holdings.
//!
//! Sorted captures are counted per key ([`aggregate`]), then streamed through
//! a [`compact::Compactor`] which collapses dense parts of the SURT hierarchy
//! into wildcard records while writing. The resulting file can be queried
//! with [`lookup::Summary`] without loading it.

pub mod aggregate;
pub mod compact;
pub mod config;
pub mod fs;
pub mod lookup;
pub mod record;
pub mod surt;

pub use compact::{compact, generate, Stats};
pub use config::Config;
pub use lookup::{Hit, Summary};
