//! Map and reduce applications, plus the glue that runs them as the
//! executables a worker invokes: `mrl-map <input> <output>` and
//! `mrl-reduce <input> <output>`.
//!
//! Map output and reduce input are text, one record per line. A mapper
//! writes `key value`; the worker groups those into `key v1 v2 ...` lines
//! before a reducer sees them.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;

pub mod vertex_degree;
pub mod wc;

/////////////////////////////////////////////////////////////////////////////
// Workloads
/////////////////////////////////////////////////////////////////////////////

/// A map function takes a key-value pair: the input file name and its
/// contents. It returns an iterator that yields new key-value pairs.
pub type MapFn = fn(kv: KeyValue) -> MapOutput;

pub type MapOutput = Result<Box<dyn Iterator<Item = Result<KeyValue>>>>;

/// A reduce function takes a key and an iterator over the values for that
/// key, and returns the bytes to write for it.
pub type ReduceFn = fn(key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<Bytes>;

/// A map reduce application.
#[derive(Clone, Copy)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/// Look up a workload by the name given on the command line.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "wc" => Some(Workload {
            map_fn: wc::map,
            reduce_fn: wc::reduce,
        }),
        "vertex-degree" => Some(Workload {
            map_fn: vertex_degree::map,
            reduce_fn: vertex_degree::reduce,
        }),
        _ => None,
    }
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    pub key: Bytes,
    pub value: Bytes,
}

impl KeyValue {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

pub fn string_from_bytes(bytes: Bytes) -> Result<String> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn single_word(bytes: &Bytes, what: &str) -> Result<String> {
    let word = string_from_bytes(bytes.clone())?;
    if word.is_empty() || word.contains(char::is_whitespace) {
        bail!("{what} `{word}` must be a single non-empty word");
    }
    Ok(word)
}

/////////////////////////////////////////////////////////////////////////////
// Running as an executable
/////////////////////////////////////////////////////////////////////////////

/// Map `input` into `output`, one `key value` line per emitted pair.
/// Returns the number of pairs written.
pub fn run_map(workload: &Workload, input: &Path, output: &Path) -> Result<usize> {
    let contents =
        fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", input.display()))?;

    let mut writer = BufWriter::new(File::create(output)?);
    let mut pairs = 0;
    for kv in (workload.map_fn)(KeyValue::new(name, contents))? {
        let kv = kv?;
        let key = single_word(&kv.key, "key")?;
        let value = single_word(&kv.value, "value")?;
        writeln!(writer, "{} {}", key, value)?;
        pairs += 1;
    }
    writer.flush()?;
    Ok(pairs)
}

/// Reduce every `key v1 v2 ...` line of `input` into `output`.
/// Returns the number of keys reduced.
pub fn run_reduce(workload: &Workload, input: &Path, output: &Path) -> Result<usize> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("failed to open {}", input.display()))?,
    );
    let mut writer = BufWriter::new(File::create(output)?);

    let mut keys = 0;
    for line in reader.lines() {
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(key) = words.next() else {
            continue;
        };
        let values = words.map(|value| Bytes::copy_from_slice(value.as_bytes()));
        let reduced = (workload.reduce_fn)(Bytes::copy_from_slice(key.as_bytes()), Box::new(values))?;
        writer.write_all(&reduced)?;
        keys += 1;
    }
    writer.flush()?;
    Ok(keys)
}
