use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod args;
use args::Args;

mod client;
use client::MasterClient;

mod core;
use crate::core::{MRWorker, WorkerContext};

mod map;
mod process;
mod reduce;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let role = args.role;

    let client = MasterClient::new(&args.host, args.port)
        .with_retries(args.connect_attempts, Duration::from_secs(args.connect_backoff_secs));
    let context = WorkerContext {
        role,
        cwd: args.cwd,
        executable: args.executable,
        output_path: args.output_path,
        num_buckets: args.num_buckets,
    };

    let processed = MRWorker::new(client, context).run().await?;
    info!("{} worker processed {} units, exiting", role, processed);
    Ok(())
}
