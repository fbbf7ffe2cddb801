//! Partition list cache
//!
//! Keeps the partition list of a remote table in a local file so repeated
//! runs skip the expensive enumeration call.

pub mod cache;
pub mod source;

pub use cache::PartitionListCache;
pub use source::{PartitionSource, SourceError};
