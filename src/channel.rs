//! Persistent command connection to the camera controller.
//!
//! One TCP connection carries line-framed text commands. Every round trip
//! runs under a caller-supplied deadline, and consecutive commands are paced
//! by a minimum inter-command delay the controller firmware requires.

use crate::protocol::{self, ProtocolError, MAX_REPLY_SIZE};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
    #[error("connection closed by controller")]
    Closed,
    #[error("no reply within {0:?}")]
    CommandTimeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// How long to listen for straggler replies after a timed-out command.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

pub struct CommandChannel {
    stream: BufReader<TcpStream>,
    peer: String,
    command_delay: Duration,
    last_command: Option<Instant>,
    /// Set after a timed-out round trip: a reply may still be on its way,
    /// and reads no longer line up with writes until it is discarded.
    desynced: bool,
}

impl CommandChannel {
    pub async fn connect(addr: &str, command_delay: Duration) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ChannelError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!(peer = addr, "camera channel connected");
        Ok(Self {
            stream: BufReader::new(stream),
            peer: addr.to_string(),
            command_delay,
            last_command: None,
            desynced: false,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one command and return its accepted payload (sentinel stripped).
    ///
    /// The deadline covers the write and the full reply. A timed-out or
    /// failed round trip leaves the connection in an unknown state; callers
    /// decide whether to retry or reconcile with a clear.
    pub async fn round_trip(
        &mut self,
        command: &str,
        deadline: Duration,
    ) -> Result<String, ChannelError> {
        if self.desynced {
            self.drain().await;
        }
        self.pace().await;

        let stream = &mut self.stream;
        let io = async move {
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;

            let mut line = String::with_capacity(128);
            let n = stream
                .take(MAX_REPLY_SIZE as u64 + 2)
                .read_line(&mut line)
                .await?;
            if n == 0 {
                return Err(ChannelError::Closed);
            }
            Ok(line)
        };

        let line = match timeout(deadline, io).await {
            Ok(result) => result,
            Err(_) => {
                warn!(peer = %self.peer, command, ?deadline, "command deadline exceeded");
                self.desynced = true;
                Err(ChannelError::CommandTimeout(deadline))
            }
        };
        self.last_command = Some(Instant::now());

        let line = line?;
        let payload = protocol::accept_reply(&line)?;
        Ok(payload.to_string())
    }

    /// Discard replies left over from a timed-out command.
    ///
    /// A late reply sitting in the buffer when the next command goes out
    /// would otherwise be read as that command's reply. A straggler slower
    /// than the drain window is still possible; the per-command deadline
    /// bounds how stale it can be.
    async fn drain(&mut self) {
        loop {
            let mut line = String::new();
            let stream = &mut self.stream;
            let read = timeout(
                DRAIN_WINDOW,
                stream.take(MAX_REPLY_SIZE as u64 + 2).read_line(&mut line),
            )
            .await;
            match read {
                Ok(Ok(n)) if n > 0 => {
                    warn!(peer = %self.peer, stale = line.trim(), "discarding stale reply");
                }
                _ => break,
            }
        }
        self.desynced = false;
    }

    /// Hold off until the inter-command delay since the last command elapsed.
    async fn pace(&mut self) {
        if let Some(last) = self.last_command {
            let elapsed = last.elapsed();
            if elapsed < self.command_delay {
                sleep(self.command_delay - elapsed).await;
            }
        }
    }
}
