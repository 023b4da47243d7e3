//! Backend adapters: one uniform contract over three engine families.
//!
//! Each adapter owns a child process per session and drives it through a
//! short-lived-connection monitor channel. The contract is uniform;
//! capability descriptors tell the service which operations a variant
//! actually implements, and the variant stubs remain as a backstop that
//! fails with an explicit unsupported error rather than silently
//! succeeding.

mod openocd;
mod qemu;
mod renode;

pub use openocd::OpenocdAdapter;
pub use qemu::QemuAdapter;
pub use renode::RenodeAdapter;

use crate::console::ConsoleSink;
use crate::error::{Error, Result};
use crate::model::{BoardConfig, Capability, InjectEvent, SessionRecord};
use crate::monitor::MonitorChannel;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

/// Uniform adapter contract over the backend engines.
///
/// `start_session` mutates the passed record with the allocated ports and
/// child pid; on success the child is alive and its monitor channel is
/// usable. All other operations address the session by identifier and
/// fail with a session not-found error when the tag is unknown.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Static capability descriptor for this backend.
    fn capabilities(&self) -> Capability;

    /// Launch the child for a new session. The cancellation token covers
    /// child supervision: a caller aborted during startup kills the
    /// freshly spawned child instead of leaking it.
    async fn start_session(
        &self,
        session: &mut SessionRecord,
        config: &BoardConfig,
        console: Option<ConsoleSink>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Terminate the child forcibly and drop internal bookkeeping.
    async fn stop_session(&self, session_id: &str) -> Result<()>;

    /// Reset the simulated target.
    async fn reset_session(&self, session_id: &str) -> Result<()>;

    /// Place a firmware image at the target.
    async fn load_program(&self, session_id: &str, program_path: &Path) -> Result<()>;

    /// Start (or continue) target execution.
    async fn execute(&self, session_id: &str) -> Result<()>;

    /// Halt target execution.
    async fn pause(&self, session_id: &str) -> Result<()>;

    /// Resume after a pause.
    async fn resume(&self, session_id: &str) -> Result<()>;

    /// Allocated debug-bridge port for this session.
    async fn gdb_port(&self, session_id: &str) -> Result<u16>;

    async fn create_snapshot(&self, session_id: &str, snapshot_path: &Path) -> Result<()>;

    async fn restore_snapshot(&self, session_id: &str, snapshot_path: &Path) -> Result<()>;

    /// Pull-style console fallback for backends without push wiring.
    async fn read_console(&self, _session_id: &str) -> Result<String> {
        Err(Error::Unsupported {
            backend: self.capabilities().backend,
            operation: "read_console",
        })
    }

    /// Advance the target by an instruction count.
    async fn step(&self, session_id: &str, steps: u64) -> Result<()>;

    /// Begin coverage collection to the given path.
    async fn start_coverage(&self, session_id: &str, output_path: &Path) -> Result<()>;

    async fn stop_coverage(&self, session_id: &str) -> Result<()>;

    /// Advance the target for a wall-clock span. Variants without a
    /// native time advance approximate with resume, a cancellable sleep,
    /// then pause; caller cancellation during the sleep yields
    /// [`Error::Cancelled`].
    async fn run_for(
        &self,
        session_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Apply an out-of-band stimulus to the running target.
    async fn inject_event(&self, session_id: &str, event: &InjectEvent) -> Result<()>;
}

/// Move the child's stdout/stderr into pump tasks feeding the console
/// sink. Chunks are forwarded in read order; the tasks end when the
/// child closes its pipes.
pub(crate) fn wire_console(child: &mut Child, sink: &ConsoleSink) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, sink.clone()));
    }
}

async fn pump<R>(mut reader: R, sink: ConsoleSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.write(&buf[..n]).await,
        }
    }
}

/// Soft time advance for variants lacking a native one: resume, sleep
/// for the span, pause. The sleep honours caller cancellation; the
/// dial timeouts inside `send` stay fixed regardless.
pub(crate) async fn resume_sleep_pause(
    monitor: &MonitorChannel,
    resume_command: &str,
    pause_command: &str,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    monitor.send(resume_command).await?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    }

    monitor.send(pause_command).await
}

/// Kill a freshly spawned child when the caller cancelled mid-start.
pub(crate) async fn abort_start_if_cancelled(
    child: &mut Child,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        let _ = child.kill().await;
        return Err(Error::Cancelled);
    }
    Ok(())
}

pub(crate) fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
