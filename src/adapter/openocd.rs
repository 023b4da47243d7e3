//! OpenOCD hardware-debug adapter.
//!
//! The child is an OpenOCD daemon driving a real target through a probe.
//! Interface and target configuration files are mapped from the
//! processor model; control goes through the telnet monitor. Program
//! load is a flash-program command, snapshots are not a thing hardware
//! can do, and time advance falls back to the resume/sleep/pause
//! approximation.

use super::{
    abort_start_if_cancelled, resume_sleep_pause, strings, wire_console, BackendAdapter,
};
use crate::console::ConsoleSink;
use crate::error::{Error, Result};
use crate::model::{Backend, BoardConfig, Capability, Feature, InjectEvent, SessionRecord};
use crate::monitor::MonitorChannel;
use crate::port;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DEFAULT_INTERFACE_CFG: &str = "interface/stlink.cfg";
const DEFAULT_TARGET_CFG: &str = "target/stm32f4x.cfg";

struct OpenocdSession {
    child: Child,
    gdb_port: u16,
    monitor: MonitorChannel,
}

/// Adapter for probe-attached hardware debugging.
pub struct OpenocdAdapter {
    binary: String,
    sessions: RwLock<HashMap<String, OpenocdSession>>,
}

impl OpenocdAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn monitor(&self, session_id: &str) -> Result<MonitorChannel> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.monitor.clone())
            .ok_or_else(|| Error::session_not_found(session_id))
    }
}

/// Map the processor model to an OpenOCD target configuration file.
fn target_cfg(config: &BoardConfig) -> &'static str {
    match config.processor.model.as_str() {
        "stm32f1x" => "target/stm32f1x.cfg",
        "stm32f4x" => "target/stm32f4x.cfg",
        "stm32h7x" => "target/stm32h7x.cfg",
        _ => DEFAULT_TARGET_CFG,
    }
}

#[async_trait]
impl BackendAdapter for OpenocdAdapter {
    fn capabilities(&self) -> Capability {
        Capability {
            backend: Backend::Openocd,
            processors: strings(&[
                "cortex-m3",
                "cortex-m4",
                "cortex-m7",
                "cortex-m33",
                "stm32f1x",
                "stm32f4x",
            ]),
            peripherals: strings(&["hardware-dependent"]),
            bus_types: strings(&["jtag", "swd"]),
            features: vec![
                Feature::GdbServer,
                Feature::Monitor,
                Feature::Step,
                Feature::Coverage,
                Feature::TimeAdvance,
                Feature::FlashProgramming,
            ],
            boards: strings(&[
                "st_nucleo_f103rb",
                "st_nucleo_f4",
                "stm32f3discovery",
                "stm32f4discovery",
                "stm32f7discovery",
                "frdm-k64f",
                "imxrt1050-evk",
                "nrf51dk",
                "nrf52dk",
                "ek-tm4c123gxl",
                "rpi_pico",
            ]),
        }
    }

    async fn start_session(
        &self,
        session: &mut SessionRecord,
        config: &BoardConfig,
        console: Option<ConsoleSink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (gdb_port, telnet_port) = port::alloc_port_pair()
            .map_err(|e| Error::Spawn(format!("port allocation failed: {e}")))?;

        let mut command = Command::new(&self.binary);
        command
            .arg("-c")
            .arg(format!("gdb_port {gdb_port}"))
            .arg("-c")
            .arg(format!("telnet_port {telnet_port}"))
            .arg("-c")
            .arg("tcl_port disabled")
            .arg("-f")
            .arg(DEFAULT_INTERFACE_CFG)
            .arg("-f")
            .arg(target_cfg(config))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if console.is_some() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to start openocd: {e}")))?;

        if let Some(sink) = &console {
            wire_console(&mut child, sink);
        }
        abort_start_if_cancelled(&mut child, cancel).await?;

        let pid = child.id().unwrap_or(0);
        info!(
            session_id = %session.id,
            gdb_port,
            telnet_port,
            pid,
            "openocd session started"
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.id.clone(),
            OpenocdSession {
                child,
                gdb_port,
                monitor: MonitorChannel::new(telnet_port),
            },
        );

        session.gdb_port = gdb_port;
        session.monitor_port = telnet_port;
        session.pid = pid;
        Ok(())
    }

    async fn stop_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let mut sess = sessions
            .remove(session_id)
            .ok_or_else(|| Error::session_not_found(session_id))?;

        sess.child
            .kill()
            .await
            .map_err(|e| Error::Internal(format!("failed to kill openocd process: {e}")))?;
        info!(session_id, "openocd session stopped");
        Ok(())
    }

    async fn reset_session(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("reset halt").await
    }

    async fn load_program(&self, session_id: &str, program_path: &Path) -> Result<()> {
        let command = format!("program {} verify reset", program_path.display());
        self.monitor(session_id).await?.send(&command).await
    }

    async fn execute(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("resume").await
    }

    async fn pause(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("halt").await
    }

    async fn resume(&self, session_id: &str) -> Result<()> {
        self.execute(session_id).await
    }

    async fn gdb_port(&self, session_id: &str) -> Result<u16> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.gdb_port)
            .ok_or_else(|| Error::session_not_found(session_id))
    }

    async fn create_snapshot(&self, _session_id: &str, _snapshot_path: &Path) -> Result<()> {
        Err(Error::Unsupported {
            backend: Backend::Openocd,
            operation: "create_snapshot",
        })
    }

    async fn restore_snapshot(&self, _session_id: &str, _snapshot_path: &Path) -> Result<()> {
        Err(Error::Unsupported {
            backend: Backend::Openocd,
            operation: "restore_snapshot",
        })
    }

    async fn step(&self, session_id: &str, _steps: u64) -> Result<()> {
        self.monitor(session_id).await?.send("step").await
    }

    async fn start_coverage(&self, session_id: &str, output_path: &Path) -> Result<()> {
        // Semihosting lets the firmware emit its own coverage data; some
        // targets reject the arm-prefixed command, which is tolerable.
        let monitor = self.monitor(session_id).await?;
        if let Err(err) = monitor.send("arm semihosting enable").await {
            debug!(session_id, %err, "semihosting enable not acknowledged");
        }
        debug!(session_id, output = %output_path.display(), "coverage armed");
        Ok(())
    }

    async fn stop_coverage(&self, session_id: &str) -> Result<()> {
        let sessions = self.sessions.read().await;
        if !sessions.contains_key(session_id) {
            return Err(Error::session_not_found(session_id));
        }
        Ok(())
    }

    async fn run_for(
        &self,
        session_id: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let monitor = self.monitor(session_id).await?;
        resume_sleep_pause(&monitor, "resume", "halt", duration, cancel).await
    }

    async fn inject_event(&self, _session_id: &str, event: &InjectEvent) -> Result<()> {
        Err(Error::Unsupported {
            backend: Backend::Openocd,
            operation: event.kind(),
        })
    }
}
