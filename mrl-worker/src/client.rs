//! Talking to the master. Every exchange gets its own connection.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use common::codec::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MasterClient {
    addr: String,
    attempts: usize,
    backoff: Duration,
}

impl MasterClient {
    /// A client that tries to connect once, with no retries.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Override how hard `connect` tries before giving up.
    pub fn with_retries(mut self, attempts: usize, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    async fn connect(&self) -> Result<TcpStream> {
        let mut attempt = 1;
        loop {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt >= self.attempts => {
                    return Err(anyhow!(
                        "could not reach the master at {} after {} attempts: {}",
                        self.addr,
                        attempt,
                        e
                    ));
                }
                Err(e) => {
                    warn!("Connecting to {} failed ({}), retrying", self.addr, e);
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send(stream: &mut TcpStream, message: &Message) -> Result<()> {
        stream.write_all(message.encode()?.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Send a one-way message: a report or a progress line.
    pub async fn notify(&self, message: &Message) -> Result<()> {
        let mut stream = self.connect().await?;
        Self::send(&mut stream, message).await?;
        stream.shutdown().await?;
        debug!("Sent {} to the master", message);
        Ok(())
    }

    /// Ask for a unit. `None` means the phase is over and the worker should exit.
    pub async fn request_unit(&self) -> Result<Option<String>> {
        let mut stream = self.connect().await?;
        Self::send(&mut stream, &Message::WorkerReady).await?;

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await?;
        match Message::decode(&line)? {
            Message::JobStart(unit) => Ok(Some(unit)),
            Message::ServerDone => Ok(None),
            other => bail!("master answered a request for work with {}", other),
        }
    }
}
