//! Starting the worker processes of a phase.
//!
//! Workers are either spawned on this machine or on remote nodes through
//! `ssh`. Either way a launch completes when the worker process exits, which
//! a well-behaved worker only does after the master says there is no more work.

use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;
use common::Phase;
use rand::seq::SliceRandom;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// What a worker process needs to find the master and do its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub phase: Phase,

    /// Path of the `mrl-worker` binary.
    pub program: PathBuf,

    /// Host and port the worker should connect back to.
    pub master_host: String,
    pub master_port: u16,

    /// Working directory the worker resolves relative paths against.
    pub cwd: PathBuf,

    /// Map or reduce executable, with any arguments of its own.
    pub executable: String,

    /// Where the worker writes its results.
    pub output_path: PathBuf,

    /// Number of hash buckets; only mappers need it.
    pub num_buckets: usize,
}

impl WorkerSpec {
    /// Command line of the worker process, program first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.program.to_string_lossy().into_owned(),
            "--role".to_string(),
            self.phase.to_string(),
            "--host".to_string(),
            self.master_host.clone(),
            "--port".to_string(),
            self.master_port.to_string(),
            "--cwd".to_string(),
            self.cwd.to_string_lossy().into_owned(),
            "--executable".to_string(),
            self.executable.clone(),
            "--output-path".to_string(),
            self.output_path.to_string_lossy().into_owned(),
        ];
        if self.phase == Phase::Map {
            argv.push("--num-buckets".to_string());
            argv.push(self.num_buckets.to_string());
        }
        argv
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start `count` workers for `spec.phase` and wait for all of them to
    /// exit. Returns how many did not exit cleanly.
    async fn launch_workers(&self, spec: &WorkerSpec, count: usize) -> Result<usize>;
}

/// Runs workers as child processes of the master.
#[derive(Debug, Default)]
pub struct LocalLauncher;

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch_workers(&self, spec: &WorkerSpec, count: usize) -> Result<usize> {
        let argv = spec.argv();
        let commands = (0..count)
            .map(|i| {
                let mut command = Command::new(&argv[0]);
                command.args(&argv[1..]).kill_on_drop(true);
                (format!("local worker {i}"), command)
            })
            .collect();
        Ok(run_to_completion(commands).await)
    }
}

/// Runs workers on remote nodes over `ssh`, assigning nodes at random.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    user: String,
    nodes: Vec<String>,
}

impl SshLauncher {
    pub fn new(user: String, nodes: Vec<String>) -> Self {
        Self { user, nodes }
    }

    /// One node per worker. Nodes are shuffled, then reused round robin when
    /// there are more workers than nodes.
    pub fn assign_nodes(&self, count: usize) -> Vec<String> {
        let mut nodes = self.nodes.clone();
        nodes.shuffle(&mut rand::thread_rng());
        nodes.into_iter().cycle().take(count).collect()
    }

    /// Arguments passed to `ssh` for running `spec` on `node`.
    pub fn ssh_args(&self, node: &str, spec: &WorkerSpec) -> Vec<String> {
        vec![
            "-o".to_string(),
            "ConnectTimeout=5".to_string(),
            format!("{}@{}", self.user, node),
            shell_words::join(spec.argv()),
        ]
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    async fn launch_workers(&self, spec: &WorkerSpec, count: usize) -> Result<usize> {
        if self.nodes.is_empty() {
            bail!("no remote nodes to launch {} workers on", spec.phase);
        }
        let commands = self
            .assign_nodes(count)
            .into_iter()
            .map(|node| {
                let mut command = Command::new("ssh");
                command.args(self.ssh_args(&node, spec)).kill_on_drop(true);
                (node, command)
            })
            .collect();
        Ok(run_to_completion(commands).await)
    }
}

/// Spawn every command, wait for all of them, and count the unclean exits.
async fn run_to_completion(commands: Vec<(String, Command)>) -> usize {
    let mut running = JoinSet::new();
    for (label, mut command) in commands {
        info!("Spawning {}: {:?}", label, command.as_std());
        running.spawn(async move {
            let status = command.status().await;
            (label, status)
        });
    }

    let mut failures = 0;
    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((label, Ok(status))) if status.success() => {
                info!("{} exited cleanly", label);
            }
            Ok((label, Ok(status))) => {
                warn!("{} exited with {}", label, status);
                failures += 1;
            }
            Ok((label, Err(e))) => {
                error!("{} could not be started: {}", label, e);
                failures += 1;
            }
            Err(e) => {
                error!("worker launch task failed: {}", e);
                failures += 1;
            }
        }
    }
    failures
}
