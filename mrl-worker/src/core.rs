use std::path::PathBuf;

use anyhow::Result;
use common::codec::Message;
use common::Phase;
use tracing::{info, warn};

use crate::client::MasterClient;
use crate::{map, reduce};

/// What every unit of this worker's phase is processed with.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub role: Phase,

    /// Directory the executable runs in.
    pub cwd: PathBuf,

    /// Map or reduce executable, with any arguments of its own.
    pub executable: String,

    /// Intermediate directory for mappers, output directory for reducers.
    pub output_path: PathBuf,

    pub num_buckets: usize,
}

#[derive(Debug)]
pub struct MRWorker {
    client: MasterClient,
    context: WorkerContext,
}

impl MRWorker {
    pub fn new(client: MasterClient, context: WorkerContext) -> Self {
        Self { client, context }
    }

    /// Request, process and report units until the master says the phase
    /// is over. Returns how many units were processed successfully.
    ///
    /// A unit that fails is reported as failed and the loop carries on; only
    /// failing to ask for work or to report on it ends the loop early.
    pub async fn run(&self) -> Result<usize> {
        let mut processed = 0;

        while let Some(unit) = self.client.request_unit().await? {
            self.progress(format!("About to process \"{unit}\".")).await;

            let report = match self.process(&unit).await {
                Ok(()) => {
                    processed += 1;
                    Message::JobSucceeded(unit)
                }
                Err(e) => {
                    warn!("Failed to process \"{}\": {:#}", unit, e);
                    Message::JobFailed(unit)
                }
            };
            self.client.notify(&report).await?;
        }

        info!("Master has no more {} work", self.context.role);
        self.progress(format!(
            "No more {} units, so shutting down after processing {}.",
            self.context.role, processed
        ))
        .await;
        Ok(processed)
    }

    /// Progress lines are only logged by the master, so losing one is not fatal.
    async fn progress(&self, text: String) {
        if let Err(e) = self.client.notify(&Message::JobInfo(text)).await {
            warn!("Could not send progress to the master: {:#}", e);
        }
    }

    async fn process(&self, unit: &str) -> Result<()> {
        match self.context.role {
            Phase::Map => map::perform_map(&self.context, unit).await,
            Phase::Reduce => reduce::perform_reduce(&self.context, unit).await,
        }
    }
}
