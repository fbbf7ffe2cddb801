//! Cache file codec
//!
//! Plain text, one partition per line. No header, checksum or version.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Line separator used when writing
#[cfg(windows)]
pub const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_SEPARATOR: &str = "\n";

/// Read every line of the cache file.
///
/// Invalid UTF-8 is an error.
pub fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(split_lines(&contents))
}

/// Split on `\n`, `\r\n` or a lone `\r`.
///
/// Empty interior lines are kept; a trailing separator does not add an entry.
fn split_lines(contents: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut rest = contents;

    while !rest.is_empty() {
        match rest.find(['\r', '\n']) {
            Some(idx) => {
                lines.push(rest[..idx].to_string());
                let separator_len = if rest[idx..].starts_with("\r\n") { 2 } else { 1 };
                rest = &rest[idx + separator_len..];
            }
            None => {
                lines.push(rest.to_string());
                break;
            }
        }
    }

    lines
}

/// Create or truncate the cache file and write one entry per line.
///
/// Parent directories are not created.
pub fn write_lines(path: &Path, lines: &[String]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for line in lines {
        writer.write_all(line.as_bytes())?;
        writer.write_all(LINE_SEPARATOR.as_bytes())?;
    }
    writer.flush()
}
