use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "MapReduce master", long_about = None)]
pub struct Args {
    /// Job configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Worker binary for the map phase. Defaults to the mrl-worker next to this binary.
    #[arg(short, long)]
    pub mapper: Option<PathBuf>,

    /// Worker binary for the reduce phase. Defaults to the mrl-worker next to this binary.
    #[arg(short, long)]
    pub reducer: Option<PathBuf>,

    /// The port for the server to listen on. Defaults to one derived from user and host.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Only log warnings and errors.
    #[arg(short, long)]
    pub quiet: bool,

    /// Stop once the map phase is done.
    #[arg(long)]
    pub map_only: bool,

    /// Comma separated hosts to run workers on over ssh. Workers run locally when absent.
    #[arg(short, long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Reissue a unit if its worker has not reported within this many seconds.
    #[arg(long)]
    pub lease_secs: Option<u64>,
}
