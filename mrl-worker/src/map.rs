use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use common::bucket_for;
use common::utils::{input_stem, mapped_path, partition_path};
use tracing::info;

use crate::core::WorkerContext;
use crate::process::run_executable;

/// Map one input file: run the map executable over it, then split its
/// output into one partition file per hash bucket.
pub async fn perform_map(context: &WorkerContext, unit: &str) -> Result<()> {
    let input = PathBuf::from(unit);
    let stem = input_stem(&input)?;
    let intermediate = context.output_path.clone();
    let mapped = mapped_path(&intermediate, &stem);

    info!("Mapping {} into {}", input.display(), mapped.display());
    run_executable(&context.executable, &context.cwd, &input, &mapped).await?;

    let num_buckets = context.num_buckets;
    let records = tokio::task::spawn_blocking(move || -> Result<usize> {
        let records = partition(&mapped, &intermediate, &stem, num_buckets)?;
        fs::remove_file(&mapped)
            .with_context(|| format!("failed to remove {}", mapped.display()))?;
        Ok(records)
    })
    .await??;

    info!("Partitioned {} records of {} into {} buckets", records, unit, num_buckets);
    Ok(())
}

/// Split `mapped` line by line into `num_buckets` partition files, choosing
/// the bucket from the hash of each line's first word. Every partition file
/// is created, even if it ends up empty. Returns the number of records.
pub fn partition(mapped: &Path, intermediate: &Path, stem: &str, num_buckets: usize) -> Result<usize> {
    if num_buckets == 0 {
        bail!("cannot partition into zero buckets");
    }

    let reader = BufReader::new(
        File::open(mapped).with_context(|| format!("failed to open {}", mapped.display()))?,
    );
    let mut partitions = (0..num_buckets)
        .map(|bucket| {
            let path = partition_path(intermediate, stem, bucket);
            File::create(&path)
                .map(BufWriter::new)
                .with_context(|| format!("failed to create {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut records = 0;
    for line in reader.lines() {
        let line = line?;
        let Some(key) = line.split_whitespace().next() else {
            continue;
        };
        let bucket = bucket_for(key.as_bytes(), num_buckets);
        writeln!(partitions[bucket], "{}", line)?;
        records += 1;
    }

    for partition in &mut partitions {
        partition.flush()?;
    }
    Ok(records)
}
