mod args;
mod config;
mod handler;
mod launcher;
mod semaphore;
mod server;
mod staging;
mod thread_pool;
mod work_queue;

use std::time::Duration;

use anyhow::{Context, Result};
use args::Args;
use clap::Parser;
use config::Config;
use launcher::{Launcher, LocalLauncher, SshLauncher};
use server::{MRServer, ServerOptions};
use tracing::{info, Level};

const WORKER_BINARY: &str = "mrl-worker";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.quiet { Level::WARN } else { Level::INFO })
        .init();

    let cwd = std::env::current_dir().context("could not read the current directory")?;
    let config = Config::load(&args.config, &cwd)?;

    let host = hostname::get()
        .context("could not determine this machine's host name")?
        .to_string_lossy()
        .into_owned();
    let user = whoami::username();
    let port = args
        .port
        .unwrap_or_else(|| server::default_port(&user, &host));

    let (launcher, master_host): (Box<dyn Launcher>, String) = if args.nodes.is_empty() {
        (Box::new(LocalLauncher), "127.0.0.1".to_string())
    } else {
        info!("Workers will run on {}", args.nodes.join(", "));
        (Box::new(SshLauncher::new(user, args.nodes)), host)
    };

    let map_worker = match args.mapper {
        Some(path) => path,
        None => server::sibling_binary(WORKER_BINARY)?,
    };
    let reduce_worker = match args.reducer {
        Some(path) => path,
        None => server::sibling_binary(WORKER_BINARY)?,
    };

    let options = ServerOptions {
        port,
        master_host,
        cwd,
        map_worker,
        reduce_worker,
        map_only: args.map_only,
        lease: args.lease_secs.map(Duration::from_secs),
        connection_timeout: server::CONNECTION_TIMEOUT,
    };

    let server = MRServer::start(config, options, launcher)?;
    server.run_until(tokio::signal::ctrl_c()).await
}
