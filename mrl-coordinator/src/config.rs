//! The job configuration file.
//!
//! One `key value` pair per line; the value is the rest of the line. Every
//! key below must appear exactly once and nothing else may appear:
//!
//! ```text
//! mapper            target/release/mrl-map --workload wc
//! reducer           target/release/mrl-reduce --workload wc
//! num-mappers       4
//! num-reducers      2
//! input-path        files/input
//! intermediate-path files/intermediate
//! output-path       files/output
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Upper bound on mappers and reducers, one pool thread each.
pub const MAX_WORKERS: usize = 32;
const MIN_WORKERS: usize = 1;

const REQUIRED_KEYS: [&str; 7] = [
    "mapper",
    "reducer",
    "num-mappers",
    "num-reducers",
    "input-path",
    "intermediate-path",
    "output-path",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file named \"{path}\" could not be opened: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("configuration file key of \"{0}\" not recognized")]
    UnknownKey(String),

    #[error("configuration file key of \"{0}\" supplied multiple times")]
    DuplicateKey(String),

    #[error("configuration file key of \"{0}\" has no value")]
    MissingValue(String),

    #[error("one or more required keys missing from configuration file: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("value of \"{key}\" must be a number in [{min}, {max}], got \"{value}\"")]
    InvalidNumber {
        key: String,
        value: String,
        min: usize,
        max: usize,
    },

    #[error("directory for \"{key}\" does not exist: {}", .path.display())]
    MissingDirectory { key: String, path: PathBuf },
}

/// Everything a run needs to know from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Map executable, possibly followed by its own arguments.
    pub mapper: String,

    /// Reduce executable, possibly followed by its own arguments.
    pub reducer: String,

    pub num_mappers: usize,
    pub num_reducers: usize,

    pub input_path: PathBuf,
    pub intermediate_path: PathBuf,
    pub output_path: PathBuf,
}

impl Config {
    /// Read and validate the file at `path`. Relative directories are
    /// resolved against `cwd`.
    pub fn load(path: &Path, cwd: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, cwd)
    }

    pub fn parse(contents: &str, cwd: &Path) -> Result<Self, ConfigError> {
        let mut values: HashMap<&str, &str> = HashMap::new();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };

            if !REQUIRED_KEYS.contains(&key) {
                return Err(ConfigError::UnknownKey(key.to_string()));
            }
            if values.contains_key(key) {
                return Err(ConfigError::DuplicateKey(key.to_string()));
            }
            if value.is_empty() {
                return Err(ConfigError::MissingValue(key.to_string()));
            }
            values.insert(key, value);
        }

        let missing: BTreeSet<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !values.contains_key(key))
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(
                missing.into_iter().map(String::from).collect(),
            ));
        }

        Ok(Self {
            mapper: values["mapper"].to_string(),
            reducer: values["reducer"].to_string(),
            num_mappers: parse_worker_count("num-mappers", values["num-mappers"])?,
            num_reducers: parse_worker_count("num-reducers", values["num-reducers"])?,
            input_path: existing_directory("input-path", values["input-path"], cwd)?,
            intermediate_path: existing_directory(
                "intermediate-path",
                values["intermediate-path"],
                cwd,
            )?,
            output_path: existing_directory("output-path", values["output-path"], cwd)?,
        })
    }

    /// Total number of hash buckets, and so of reduce units.
    pub fn num_buckets(&self) -> usize {
        self.num_mappers * self.num_reducers
    }
}

fn parse_worker_count(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(n) if (MIN_WORKERS..=MAX_WORKERS).contains(&n) => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
            min: MIN_WORKERS,
            max: MAX_WORKERS,
        }),
    }
}

fn existing_directory(key: &str, value: &str, cwd: &Path) -> Result<PathBuf, ConfigError> {
    let path = cwd.join(value);
    match path.canonicalize() {
        Ok(path) if path.is_dir() => Ok(path),
        _ => Err(ConfigError::MissingDirectory {
            key: key.to_string(),
            path,
        }),
    }
}
