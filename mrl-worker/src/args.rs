use std::path::PathBuf;

use clap::Parser;
use common::Phase;

/// Started by the master, once per worker, for a single phase.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Which phase this worker serves: `map` or `reduce`.
    #[arg(short, long)]
    pub role: Phase,

    /// Host the master is listening on.
    #[arg(long)]
    pub host: String,

    /// Port the master is listening on.
    #[arg(short, long)]
    pub port: u16,

    /// Directory the map or reduce executable runs in.
    #[arg(short, long)]
    pub cwd: PathBuf,

    /// Map or reduce executable, with any arguments of its own.
    #[arg(short, long)]
    pub executable: String,

    /// Directory results are written to.
    #[arg(short, long)]
    pub output_path: PathBuf,

    /// Number of hash buckets map output is split into.
    #[arg(short, long, default_value_t = 1)]
    pub num_buckets: usize,

    /// How many times to try reaching the master before giving up.
    #[arg(long, default_value_t = 5)]
    pub connect_attempts: usize,

    /// Seconds to wait between connection attempts.
    #[arg(long, default_value_t = 1)]
    pub connect_backoff_secs: u64,
}
