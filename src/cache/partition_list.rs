//! Local Partition List Cache
//!
//! Caches a table's partition list in a single local file to avoid repeated
//! remote enumeration. Best effort: read and write failures only demote a
//! call to a cache miss or to a fetch without caching.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::listing_file;
use crate::source::{PartitionSource, SourceError};

/// Single-file cache in front of a partition source
pub struct PartitionListCache<S: PartitionSource + ?Sized> {
    /// Shared listing capability (owned by the caller)
    source: Arc<S>,
    /// Location of the cache file
    cache_file: PathBuf,
}

impl<S: PartitionSource + ?Sized> PartitionListCache<S> {
    /// Create a cache over `source` persisted at `cache_file`
    ///
    /// Nothing is validated: the file need not exist and the source is not
    /// contacted until the first miss.
    pub fn new(source: Arc<S>, cache_file: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache_file: cache_file.into(),
        }
    }

    /// Get all partitions, from the cache file if readable, else from the source
    ///
    /// A readable cache file is returned as-is, even if stale. On a miss the
    /// complete listing is fetched and written back; a failed write is logged
    /// and ignored.
    ///
    /// # Errors
    /// Only errors from the partition source, unchanged.
    pub fn get_all_partitions(&self) -> Result<Vec<String>, SourceError> {
        if self.cache_file.exists() {
            info!(
                path = %self.cache_file.display(),
                "Found cache file, reading partitions from file"
            );
            match listing_file::read_lines(&self.cache_file) {
                Ok(partitions) => {
                    info!(count = partitions.len(), "Partition cache HIT");
                    return Ok(partitions);
                }
                Err(e) => {
                    warn!(
                        path = %self.cache_file.display(),
                        error = %e,
                        "Error reading partitions from cache, listing from storage"
                    );
                }
            }
        }

        info!("Fetching partitions from storage");
        let partitions = self.source.list_partitions_since(None)?;

        info!(
            count = partitions.len(),
            path = %self.cache_file.display(),
            "Caching partitions to local storage"
        );
        if let Err(e) = listing_file::write_lines(&self.cache_file, &partitions) {
            warn!(
                path = %self.cache_file.display(),
                error = %e,
                "Unable to cache partitions"
            );
        }

        Ok(partitions)
    }

    /// Get the cache file path
    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }
}
