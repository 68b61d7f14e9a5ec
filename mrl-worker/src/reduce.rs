//! The reduce side of a bucket.
//!
//! Every mapper leaves one partition file per bucket. To reduce bucket
//! `NNNNN` the worker collates `*.NNNNN.mapped` into one file, sorts it,
//! folds runs of equal keys into `key v1 v2 ...` lines and finally hands
//! that file to the reduce executable.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytesize::MB;
use common::utils::{partition_glob, split_bucket_pattern};
use ext_sort::{buffer::LimitedBufferBuilder, ExternalSorter, ExternalSorterBuilder};
use glob::glob;
use itertools::Itertools;
use tracing::{debug, info};

use crate::core::WorkerContext;
use crate::process::run_executable;

/// Lines held in memory per sorted chunk.
const SORT_BUFFER_LINES: usize = MB as usize;

/// Files produced while reducing one bucket.
#[derive(Debug, Clone)]
struct ReduceFiles {
    intermediate: PathBuf,
    bucket_id: String,
    grouped: PathBuf,
    sorted: PathBuf,
    coalesced: PathBuf,
    output: PathBuf,
}

impl ReduceFiles {
    fn new(unit: &str, output_path: &Path) -> Result<Self> {
        let (intermediate, bucket_id) = split_bucket_pattern(unit)?;
        Ok(Self {
            grouped: PathBuf::from(format!("{unit}.grouped")),
            sorted: PathBuf::from(format!("{unit}.sorted")),
            coalesced: output_path.join(format!("{bucket_id}.coalesced")),
            output: output_path.join(format!("{bucket_id}.output")),
            intermediate,
            bucket_id,
        })
    }

    fn remove_temporaries(&self) {
        for path in [&self.grouped, &self.sorted, &self.coalesced] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!("Could not remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Reduce one bucket, identified by its pattern `<intermediate>/<NNNNN>`.
pub async fn perform_reduce(context: &WorkerContext, unit: &str) -> Result<()> {
    let files = ReduceFiles::new(unit, &context.output_path)?;
    info!("Reducing bucket {} into {}", files.bucket_id, files.output.display());

    let result = reduce_bucket(context, &files).await;
    files.remove_temporaries();
    result
}

async fn reduce_bucket(context: &WorkerContext, files: &ReduceFiles) -> Result<()> {
    let prepared = files.clone();
    let keys = tokio::task::spawn_blocking(move || -> Result<usize> {
        let partitions = collate(&prepared.intermediate, &prepared.bucket_id, &prepared.grouped)?;
        debug!("Collated {} partition files into {}", partitions, prepared.grouped.display());

        let tmp_dir = prepared.intermediate.clone();
        external_sort(&prepared.grouped, &prepared.sorted, &tmp_dir)?;
        coalesce(&prepared.sorted, &prepared.coalesced)
    })
    .await??;
    debug!("Bucket {} holds {} distinct keys", files.bucket_id, keys);

    run_executable(&context.executable, &context.cwd, &files.coalesced, &files.output).await
}

/// Concatenate every partition file of `bucket_id` into `grouped`.
/// Returns how many partition files were found.
pub fn collate(intermediate: &Path, bucket_id: &str, grouped: &Path) -> Result<usize> {
    let pattern = partition_glob(intermediate, bucket_id);
    let mut partitions = glob(&pattern)?.collect::<Result<Vec<_>, _>>()?;
    partitions.sort();

    let mut output = BufWriter::new(
        File::create(grouped).with_context(|| format!("failed to create {}", grouped.display()))?,
    );
    for partition in &partitions {
        let mut input = File::open(partition)
            .with_context(|| format!("failed to open {}", partition.display()))?;
        io::copy(&mut input, &mut output)?;
    }
    output.flush()?;
    Ok(partitions.len())
}

/// Sort the lines of `input` into `output`, spilling chunks to `tmp_dir`.
pub fn external_sort(input: &Path, output: &Path, tmp_dir: &Path) -> Result<()> {
    let input_reader = BufReader::new(File::open(input)?);
    let mut output_writer = BufWriter::new(File::create(output)?);

    let sorter: ExternalSorter<String, io::Error, LimitedBufferBuilder> =
        ExternalSorterBuilder::new()
            .with_tmp_dir(tmp_dir)
            .with_buffer(LimitedBufferBuilder::new(SORT_BUFFER_LINES, false))
            .build()
            .map_err(|e| anyhow!("could not set up sorting: {}", e))?;

    let sorted = sorter
        .sort(input_reader.lines())
        .map_err(|e| anyhow!("failed to sort {}: {}", input.display(), e))?;

    for item in sorted {
        let line = item.map_err(|e| anyhow!("failed to read back sorted data: {}", e))?;
        writeln!(output_writer, "{}", line)?;
    }
    output_writer.flush()?;
    Ok(())
}

/// Key and value of a `key value` line. The value may be empty.
fn split_record(line: &str) -> (String, String) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((key, value)) => (key.to_string(), value.trim().to_string()),
        None => (line.to_string(), String::new()),
    }
}

/// Fold runs of equal keys in the sorted file into `key v1 v2 ...` lines.
/// Returns the number of distinct keys.
pub fn coalesce(sorted: &Path, coalesced: &Path) -> Result<usize> {
    let reader = BufReader::new(File::open(sorted)?);
    let mut output = BufWriter::new(
        File::create(coalesced)
            .with_context(|| format!("failed to create {}", coalesced.display()))?,
    );

    let keys = itertools::process_results(reader.lines(), |lines| -> io::Result<usize> {
        let records = lines
            .filter(|line| !line.trim().is_empty())
            .map(|line| split_record(&line));

        let mut keys = 0;
        for (key, group) in &records.chunk_by(|(key, _)| key.clone()) {
            let values = group
                .map(|(_, value)| value)
                .filter(|value| !value.is_empty())
                .join(" ");
            if values.is_empty() {
                writeln!(output, "{}", key)?;
            } else {
                writeln!(output, "{} {}", key, values)?;
            }
            keys += 1;
        }
        Ok(keys)
    })??;

    output.flush()?;
    Ok(keys)
}
