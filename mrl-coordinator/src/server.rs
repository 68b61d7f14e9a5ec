//! The master: accepts worker connections and walks the job through its phases.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use common::Phase;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MAX_WORKERS};
use crate::handler::handle_request;
use crate::launcher::{Launcher, WorkerSpec};
use crate::staging::{dump_file_hashes, stage_buckets, stage_input_files};
use crate::thread_pool::ThreadPool;
use crate::work_queue::WorkQueue;

/// One pool thread per possible worker connection.
pub const POOL_SIZE: usize = MAX_WORKERS;

/// How long a connection may stay silent before its handler gives up.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Knobs that come from the command line rather than the configuration file.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port to listen on; 0 picks any free port.
    pub port: u16,

    /// Host name workers use to reach the master.
    pub master_host: String,

    /// Directory workers resolve relative executable paths against.
    pub cwd: PathBuf,

    /// Worker binaries for each phase.
    pub map_worker: PathBuf,
    pub reduce_worker: PathBuf,

    /// Stop after the map phase.
    pub map_only: bool,

    /// Reissue units whose report has not arrived within this long.
    pub lease: Option<Duration>,

    /// Read and write timeout on every accepted connection.
    pub connection_timeout: Duration,
}

pub struct MRServer {
    config: Config,
    options: ServerOptions,
    launcher: Box<dyn Launcher>,

    queue: Arc<WorkQueue>,
    pool: Arc<ThreadPool>,

    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl MRServer {
    /// Bind the listening socket and start accepting workers.
    pub fn start(
        config: Config,
        options: ServerOptions,
        launcher: Box<dyn Launcher>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, options.port)).with_context(
            || {
                format!(
                    "port {} is already in use, so server could not be launched",
                    options.port
                )
            },
        )?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on port {}", local_addr.port());

        let queue = Arc::new(match options.lease {
            Some(lease) => WorkQueue::with_lease(lease),
            None => WorkQueue::new(),
        });
        let pool = Arc::new(ThreadPool::new(POOL_SIZE)?);
        debug!("Serving workers from {} pool threads", pool.size());
        let running = Arc::new(AtomicBool::new(true));

        let acceptor = {
            let queue = queue.clone();
            let pool = pool.clone();
            let running = running.clone();
            let timeout = options.connection_timeout;
            thread::Builder::new()
                .name("mrl-acceptor".to_string())
                .spawn(move || orchestrate_workers(listener, &pool, &queue, &running, timeout))?
        };

        Ok(Self {
            config,
            options,
            launcher,
            queue,
            pool,
            local_addr,
            running,
            acceptor: Some(acceptor),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Run the map phase, then the reduce phase unless this is a map-only
    /// job, and log a hash of every file the last phase wrote.
    pub async fn run(&self) -> Result<()> {
        self.run_phase(Phase::Map).await?;

        let summary = if self.options.map_only {
            info!("Map-only job, skipping the reduce phase");
            &self.config.intermediate_path
        } else {
            self.run_phase(Phase::Reduce).await?;
            &self.config.output_path
        };

        dump_file_hashes(summary)?;
        info!("Job complete");
        Ok(())
    }

    /// Like [`MRServer::run`], but give up as soon as `interrupt` resolves.
    /// An interrupted job is an error.
    pub async fn run_until<F>(&self, interrupt: F) -> Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        tokio::select! {
            result = self.run() => result,
            signal = interrupt => {
                signal.context("failed to listen for the interrupt signal")?;
                warn!("Interrupted, shutting down");
                Err(anyhow!("interrupted before the job finished"))
            }
        }
    }

    async fn run_phase(&self, phase: Phase) -> Result<()> {
        let units = match phase {
            Phase::Map => stage_input_files(&self.config.input_path)?,
            Phase::Reduce => {
                stage_buckets(&self.config.intermediate_path, self.config.num_buckets())
            }
        };
        let staged = self.queue.stage(units);
        info!("Staged {} units for the {} phase", staged, phase);

        let (spec, count) = self.worker_spec(phase);
        let unclean = self.launcher.launch_workers(&spec, count).await?;
        if unclean > 0 {
            warn!("{} of {} {} workers exited uncleanly", unclean, count, phase);
        }

        if !self.queue.is_complete() {
            let status = self.queue.status();
            bail!(
                "every {} worker exited with {} units unscheduled and {} in flight",
                phase,
                status.unscheduled,
                status.in_flight
            );
        }
        info!("All {} units have been processed", phase);
        Ok(())
    }

    fn worker_spec(&self, phase: Phase) -> (WorkerSpec, usize) {
        let (program, executable, output_path, count) = match phase {
            Phase::Map => (
                &self.options.map_worker,
                &self.config.mapper,
                &self.config.intermediate_path,
                self.config.num_mappers,
            ),
            Phase::Reduce => (
                &self.options.reduce_worker,
                &self.config.reducer,
                &self.config.output_path,
                self.config.num_reducers,
            ),
        };
        let spec = WorkerSpec {
            phase,
            program: program.clone(),
            master_host: self.options.master_host.clone(),
            master_port: self.port(),
            cwd: self.options.cwd.clone(),
            executable: executable.clone(),
            output_path: output_path.clone(),
            num_buckets: self.config.num_buckets(),
        };
        (spec, count)
    }

    /// Stop accepting, release handlers still waiting on the queue, and wait
    /// for every in-progress conversation to finish.
    fn bring_down(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.queue.close();

        // Wake the acceptor so it notices the flag.
        let wake = wake_address(self.local_addr);
        if let Err(e) = TcpStream::connect(wake) {
            debug!("Could not wake the acceptor at {}: {}", wake, e);
        }
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                error!("Acceptor thread panicked");
            }
        }

        self.pool.wait();
        debug!("Worker connections drained");
    }
}

impl Drop for MRServer {
    fn drop(&mut self) {
        self.bring_down();
    }
}

fn wake_address(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
    } else {
        addr
    }
}

/// Accept connections until `running` drops, handing each one to the pool.
fn orchestrate_workers(
    listener: TcpListener,
    pool: &ThreadPool,
    queue: &Arc<WorkQueue>,
    running: &AtomicBool,
    timeout: Duration,
) {
    for stream in listener.incoming() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to accept a connection: {}", e);
                continue;
            }
        };

        let peer = stream
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        debug!("Received a connection request from {}", peer);

        let timeouts = stream
            .set_read_timeout(Some(timeout))
            .and_then(|()| stream.set_write_timeout(Some(timeout)));
        if let Err(e) = timeouts {
            warn!("Dropping connection from {}: could not set timeouts: {}", peer, e);
            continue;
        }

        let queue = queue.clone();
        pool.schedule(move || handle_request(&stream, &peer, &queue));
    }
    debug!("No longer accepting worker connections");
}

/// Default port, stable for a given user on a given machine.
pub fn default_port(user: &str, host: &str) -> u16 {
    let hash = common::ihash(format!("{user}@{host}").as_bytes());
    (hash % (65535 - 1024) + 1024) as u16
}

/// The worker binary installed next to the running coordinator.
pub fn sibling_binary(name: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe().context("could not locate the running executable")?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(name))
}
