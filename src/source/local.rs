//! Local directory partition source
//!
//! Treats a directory on disk as a table root and reports the directories
//! that hold data files, using the same derivation as the B2 source.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::{debug, info};

use super::errors::SourceError;
use super::types::partition_path;
use super::PartitionSource;

/// Partition source over a local table directory
pub struct LocalPartitionSource {
    table_dir: PathBuf,
}

impl LocalPartitionSource {
    pub fn new(table_dir: impl Into<PathBuf>) -> Self {
        Self {
            table_dir: table_dir.into(),
        }
    }

    /// Walk `dir` and push (relative name, mtime millis) for every file
    fn collect_files(
        &self,
        dir: &Path,
        relative: &str,
        out: &mut Vec<(String, u64)>,
    ) -> Result<(), SourceError> {
        let io_err = |source| SourceError::Io {
            path: dir.display().to_string(),
            source,
        };

        for entry in fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if relative.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", relative, name)
            };

            let metadata = entry.metadata().map_err(io_err)?;
            if metadata.is_dir() {
                // Table metadata (e.g. .hoodie) is never a partition
                if name.starts_with('.') {
                    continue;
                }
                self.collect_files(&entry.path(), &child, out)?;
            } else {
                let modified = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                out.push((child, modified));
            }
        }

        Ok(())
    }
}

impl PartitionSource for LocalPartitionSource {
    fn list_partitions_since(&self, since: Option<u64>) -> Result<Vec<String>, SourceError> {
        let mut files = Vec::new();
        self.collect_files(&self.table_dir, "", &mut files)?;
        debug!(dir = %self.table_dir.display(), files = files.len(), "Scanned table directory");

        let partitions: Vec<String> = files
            .iter()
            .filter(|(_, modified)| since.map_or(true, |marker| *modified > marker))
            .filter_map(|(name, _)| partition_path(name, ""))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        info!(
            dir = %self.table_dir.display(),
            partitions = partitions.len(),
            "Listed partitions from local table"
        );
        Ok(partitions)
    }
}
