//! File naming shared by the master (which stages units) and the workers
//! (which read and write the files those units name).

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::{bucket_name, BUCKET_ID_WIDTH};

/// Extension of intermediate files written by mappers.
pub const MAPPED_EXTENSION: &str = "mapped";

/// Stem of an input file with a trailing `.input` extension removed.
///
/// `/in/00012.input` -> `00012`, `/in/notes.txt` -> `notes.txt`.
pub fn input_stem(input: &Path) -> Result<String> {
    let name = input
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("input path {} has no usable file name", input.display()))?;

    Ok(name.strip_suffix(".input").unwrap_or(name).to_string())
}

/// Where a mapper writes the raw output of the map executable.
pub fn mapped_path(intermediate: &Path, stem: &str) -> PathBuf {
    intermediate.join(format!("{stem}.{MAPPED_EXTENSION}"))
}

/// One of the partition files a mapper splits its output into.
pub fn partition_path(intermediate: &Path, stem: &str, bucket: usize) -> PathBuf {
    intermediate.join(format!(
        "{stem}.{}.{MAPPED_EXTENSION}",
        bucket_name(bucket)
    ))
}

/// The reduce unit identifier for a bucket, e.g. `/tmp/intermediate/00003`.
pub fn bucket_pattern(intermediate: &Path, bucket: usize) -> String {
    intermediate.join(bucket_name(bucket)).to_string_lossy().into_owned()
}

/// Split a reduce unit back into its intermediate directory and bucket id.
pub fn split_bucket_pattern(pattern: &str) -> Result<(PathBuf, String)> {
    let path = Path::new(pattern);
    let id = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|id| id.len() == BUCKET_ID_WIDTH && id.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| anyhow!("`{pattern}` is not a bucket pattern"))?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("`{pattern}` has no parent directory"))?;

    Ok((dir.to_path_buf(), id.to_string()))
}

/// Glob matching every partition file of one bucket, across all map units.
pub fn partition_glob(intermediate: &Path, bucket_id: &str) -> String {
    intermediate
        .join(format!("*.{bucket_id}.{MAPPED_EXTENSION}"))
        .to_string_lossy()
        .into_owned()
}
