use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;

/// Map executable run by mrl-worker for each unit.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Application to run, e.g. `wc` or `vertex-degree`.
    #[arg(short, long, default_value = "wc")]
    workload: String,

    input: PathBuf,

    output: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let workload = workload::try_named(&args.workload)
        .ok_or_else(|| anyhow!("The workload `{}` is not a known workload", args.workload))?;

    workload::run_map(&workload, &args.input, &args.output)?;
    Ok(())
}
