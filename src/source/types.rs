//! Listing API types and partition path derivation
//!
//! Defines types for Backblaze B2 listing responses and the mapping from
//! object names to partition paths.

use serde::{Deserialize, Deserializer};

/// Deserialize a number that might be encoded as a string or null.
/// B2 API sometimes returns numeric fields as strings (e.g. "1536964279000")
/// and may return null for folder/hide entries.
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleU64Visitor;

    impl<'de> de::Visitor<'de> for FlexibleU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a u64, a string containing a u64, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| de::Error::custom("negative value for u64"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
            value.parse::<u64>().map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(FlexibleU64Visitor)
}

/// B2 file information from listing responses
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Full file path within the bucket
    pub file_name: String,
    /// Upload timestamp in milliseconds since epoch
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub upload_timestamp: u64,
    /// Action type: "upload", "folder", "hide", "start"
    pub action: String,
}

/// Response from b2_list_file_names API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesResponse {
    /// List of files in the response
    pub files: Vec<FileInfo>,
    /// Next file name for pagination (None if no more files)
    pub next_file_name: Option<String>,
}

impl FileInfo {
    /// Check if this entry is a completed upload (data file)
    pub fn is_upload(&self) -> bool {
        self.action == "upload" && !self.file_name.ends_with('/')
    }

    /// Whether this file was written strictly after the `since` marker
    pub fn written_since(&self, since: Option<u64>) -> bool {
        since.map_or(true, |marker| self.upload_timestamp > marker)
    }
}

/// Normalize a table prefix to either "" or "some/prefix/"
pub fn normalize_prefix(table_prefix: &str) -> String {
    let trimmed = table_prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Derive the partition path of a file relative to a table prefix.
///
/// Returns None for files outside the prefix, files directly at the table
/// root, and anything under a hidden (dot-prefixed) directory such as table
/// metadata folders.
pub fn partition_path(file_name: &str, table_prefix: &str) -> Option<String> {
    let prefix = normalize_prefix(table_prefix);
    let relative = file_name.strip_prefix(prefix.as_str())?;
    let (dir, _file) = relative.rsplit_once('/')?;

    if dir.is_empty() || dir.split('/').any(|component| component.starts_with('.')) {
        return None;
    }

    Some(dir.to_string())
}
