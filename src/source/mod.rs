//! Partition listing sources
//!
//! A source performs the authoritative (and possibly expensive) enumeration
//! of a table's partitions.

pub mod b2;
pub mod errors;
pub mod local;
pub mod types;

pub use b2::{B2Client, B2PartitionSource};
pub use errors::SourceError;
pub use local::LocalPartitionSource;

/// Capability that enumerates the partitions of one table
pub trait PartitionSource: Send + Sync {
    /// List partitions written after `since` (milliseconds since the Unix
    /// epoch). `None` requests the complete partition set.
    fn list_partitions_since(&self, since: Option<u64>) -> Result<Vec<String>, SourceError>;
}
