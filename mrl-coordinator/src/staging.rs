//! Producing the units of each phase, and summarizing what a phase wrote.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use common::ihash;
use common::utils::bucket_pattern;
use tracing::{error, info};
use walkdir::WalkDir;

/// Regular files directly inside `dir`, hidden files excluded, sorted.
fn visible_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to scan {}", dir.display()))?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Map units: every input file, as an absolute path.
///
/// A path that is not UTF-8 or spans lines cannot travel in a protocol line
/// unchanged, so it is left out and logged.
pub fn stage_input_files(input_path: &Path) -> Result<Vec<String>> {
    let mut units = Vec::new();
    for path in visible_files(input_path)? {
        match path.to_str() {
            Some(unit) if !unit.contains(['\n', '\r']) => units.push(unit.to_string()),
            _ => error!(
                "Refusing to stage {:?}: its name cannot be sent to a worker",
                path
            ),
        }
    }
    Ok(units)
}

/// Reduce units: one pattern per hash bucket.
pub fn stage_buckets(intermediate_path: &Path, num_buckets: usize) -> Vec<String> {
    (0..num_buckets)
        .map(|bucket| bucket_pattern(intermediate_path, bucket))
        .collect()
}

/// Hash of a file's contents, for eyeballing that two runs produced the same output.
pub fn file_hash(path: &Path) -> Result<u32> {
    let contents = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ihash(&contents))
}

/// Log every file in `dir` along with its content hash.
pub fn dump_file_hashes(dir: &Path) -> Result<Vec<(PathBuf, u32)>> {
    let mut hashes = Vec::new();
    for file in visible_files(dir)? {
        let hash = file_hash(&file)?;
        info!("{} hashes to {}", file.display(), hash);
        hashes.push((file, hash));
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_visible_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("00002.input"), "b").unwrap();
        fs::write(dir.path().join("00001.input"), "a").unwrap();
        fs::write(dir.path().join(".hidden"), "x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("00003.input"), "c").unwrap();

        let units = stage_input_files(dir.path()).unwrap();
        let expected: Vec<String> = ["00001.input", "00002.input"]
            .iter()
            .map(|name| dir.path().join(name).to_string_lossy().into_owned())
            .collect();
        assert_eq!(units, expected);
    }

    #[test]
    fn skips_names_that_cannot_be_sent() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good "), "a").unwrap();
        fs::write(dir.path().join("two\nlines"), "b").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff")), "c").unwrap();

        let units = stage_input_files(dir.path()).unwrap();
        assert_eq!(
            units,
            vec![dir.path().join("good ").to_string_lossy().into_owned()]
        );
    }

    #[test]
    fn stages_one_pattern_per_bucket() {
        let units = stage_buckets(Path::new("/tmp/intermediate"), 3);
        assert_eq!(
            units,
            vec![
                "/tmp/intermediate/00000",
                "/tmp/intermediate/00001",
                "/tmp/intermediate/00002"
            ]
        );
    }

    #[test]
    fn identical_contents_hash_identically() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.output"), "the 3\n").unwrap();
        fs::write(dir.path().join("b.output"), "the 3\n").unwrap();
        fs::write(dir.path().join("c.output"), "fox 1\n").unwrap();

        let hashes = dump_file_hashes(dir.path()).unwrap();
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0].1, hashes[1].1);
        assert_ne!(hashes[0].1, hashes[2].1);
    }
}
