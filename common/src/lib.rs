//! Shared pieces of the MapReduce (lite) master and its workers.
//!
//! The master hands out units of work (input files while mapping, hash
//! buckets while reducing) over a small line protocol. Everything both sides
//! must agree on lives here: the wire codec, the bucket hash and the naming
//! scheme for intermediate files.

use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use anyhow::anyhow;

pub mod codec;
pub mod utils;

/// Number of digits used when formatting a bucket id, e.g. `00042`.
pub const BUCKET_ID_WIDTH: usize = 5;

/////////////////////////////////////////////////////////////////////////////
// Phases
/////////////////////////////////////////////////////////////////////////////

/// The stage of a run. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Units are input files.
    Map,

    /// Units are hash buckets of intermediate output.
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => write!(f, "map"),
            Phase::Reduce => write!(f, "reduce"),
        }
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "map" => Ok(Phase::Map),
            "reduce" => Ok(Phase::Reduce),
            other => Err(anyhow!("`{other}` is not a phase, expected `map` or `reduce`")),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// Hashing
/////////////////////////////////////////////////////////////////////////////

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_buckets`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    (hasher.finish() & 0x7fff_ffff) as u32
}

/// Bucket a key falls into when there are `num_buckets` buckets in total.
///
/// `num_buckets` must be non-zero.
pub fn bucket_for(key: &[u8], num_buckets: usize) -> usize {
    ihash(key) as usize % num_buckets
}

/// Format a bucket id the way it appears in file names and reduce units.
pub fn bucket_name(bucket: usize) -> String {
    format!("{:0width$}", bucket, width = BUCKET_ID_WIDTH)
}
