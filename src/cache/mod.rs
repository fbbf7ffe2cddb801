//! Partition list caching layer
//!
//! Persists the partition list of a single table to one local file so the
//! remote listing call only happens when that file is missing or unreadable.

pub mod listing_file;
pub mod partition_list;

pub use partition_list::PartitionListCache;
