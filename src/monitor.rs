//! Line-oriented monitor channel to a backend child.
//!
//! Every command is one short-lived TCP connection: dial with a fixed
//! timeout, read any greeting banner under a short deadline, write the
//! command line, close. Responses are not parsed beyond transport errors.
//! The connection-per-command design trades latency for the absence of
//! in-process protocol state, so commands against the same session may be
//! issued from different tasks, subject to the backend's own
//! serialization.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::trace;

/// Fixed dial timeout, independent of caller cancellation; bounds the
/// hang against a dead backend.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for the optional greeting banner.
pub const BANNER_TIMEOUT: Duration = Duration::from_secs(1);

/// Cap on concurrent dials per session; a stuck backend would otherwise
/// bleed file descriptors at the dial timeout's cadence.
const MAX_CONCURRENT_DIALS: usize = 4;

/// Handle to one session's monitor port.
#[derive(Debug, Clone)]
pub struct MonitorChannel {
    port: u16,
    dials: Arc<Semaphore>,
}

impl MonitorChannel {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            dials: Arc::new(Semaphore::new(MAX_CONCURRENT_DIALS)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one command line. The trailing newline is appended here.
    pub async fn send(&self, command: &str) -> Result<()> {
        let _permit = self
            .dials
            .acquire()
            .await
            .map_err(|_| Error::Internal("monitor dial semaphore closed".to_string()))?;

        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", self.port)))
            .await
            .map_err(|_| Error::Transport(format!("monitor dial timed out on port {}", self.port)))?
            .map_err(|e| {
                Error::Transport(format!("monitor dial failed on port {}: {e}", self.port))
            })?;

        // Drain any banner; backends differ in whether they greet.
        let mut banner = [0u8; 1024];
        let _ = timeout(BANNER_TIMEOUT, stream.read(&mut banner)).await;

        trace!(port = self.port, command, "monitor command");

        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("monitor write failed: {e}")))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(format!("monitor write failed: {e}")))?;

        let _ = stream.shutdown().await;
        Ok(())
    }
}
