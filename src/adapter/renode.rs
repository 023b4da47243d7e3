//! Renode full-system emulator adapter.
//!
//! A generated `.resc` script configures the target (a named board
//! include, or a custom CPU with a single RAM region), starts the gdb
//! server on the allocated port, and is fed to the child at launch. All
//! control then goes through the line-oriented telnet monitor, which
//! natively covers reset, load, start/pause, snapshot save/load,
//! instruction stepping, coverage logging and virtual-time advance.

use super::{abort_start_if_cancelled, strings, wire_console, BackendAdapter};
use crate::console::ConsoleSink;
use crate::error::{Error, Result};
use crate::model::{Backend, BoardConfig, Capability, Feature, InjectEvent, SessionRecord};
use crate::monitor::MonitorChannel;
use crate::port;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Board script used when the configuration names nothing usable.
const FALLBACK_BOARD: &str = "stm32f4_discovery";

struct RenodeSession {
    child: Child,
    gdb_port: u16,
    monitor: MonitorChannel,
    script_path: PathBuf,
}

/// Adapter for the Renode emulation framework.
pub struct RenodeAdapter {
    binary: String,
    sessions: RwLock<HashMap<String, RenodeSession>>,
}

impl RenodeAdapter {
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

/// Generate the startup script for one session.
///
/// Exactly one `StartGdbServer` line is emitted, carrying the allocated
/// port; nothing else in the script mentions a debug port, so the
/// allocated one is the only authority.
fn generate_script(name: &str, gdb_port: u16, config: &BoardConfig) -> String {
    let mut script = format!(":name: {name}\n");

    if let Some(board) = config.board.as_deref().filter(|b| !b.is_empty()) {
        script.push_str(&format!("include @scripts/boards/{board}.resc\n"));
    } else if !config.processor.model.is_empty() {
        script.push_str("mach create\n");
        script.push_str(&format!(
            "machine LoadPlatformDescriptionFromString \"cpu: CPU.{} @ sysbus\"\n",
            config.processor.model
        ));
        if config.memory.ram.size > 0 {
            script.push_str(&format!(
                "machine LoadPlatformDescriptionFromString \"ram: Memory.MappedMemory @ sysbus {:#x} {{ size: {:#x} }}\"\n",
                config.memory.ram.base, config.memory.ram.size
            ));
        }
    } else {
        script.push_str(&format!("include @scripts/boards/{FALLBACK_BOARD}.resc\n"));
    }

    script.push_str(&format!("machine StartGdbServer {gdb_port}\n"));
    script
}

/// Render a duration the way the monitor's time commands expect it.
fn format_advance(duration: Duration) -> String {
    if duration.as_secs() > 0 {
        if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{:.3}s", duration.as_secs_f64())
        }
    } else if duration.as_millis() > 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}us", duration.as_micros())
    }
}

#[async_trait]
impl BackendAdapter for RenodeAdapter {
    fn capabilities(&self) -> Capability {
        Capability {
            backend: Backend::Renode,
            processors: strings(&[
                "cortex-m0",
                "cortex-m0+",
                "cortex-m3",
                "cortex-m4",
                "cortex-m7",
                "cortex-m23",
                "cortex-m33",
                "cortex-a7",
                "cortex-a9",
                "cortex-a53",
                "cortex-a72",
                "cortex-r5",
                "cortex-r52",
                "riscv32",
                "riscv64",
                "vexriscv",
                "rocket",
                "ibex",
                "sparc",
                "ppc",
                "xtensa",
                "x86",
            ]),
            peripherals: strings(&[
                "uart",
                "usart",
                "lpuart",
                "gpio",
                "spi",
                "qspi",
                "i2c",
                "timer",
                "rtc",
                "watchdog",
                "adc",
                "dac",
                "can",
                "ethernet",
                "gem",
                "macb",
                "usb",
                "sd-card",
                "display",
                "radio",
                "ieee802.15.4",
                "sensor",
                "crypto",
                "rng",
            ]),
            bus_types: strings(&["ahb", "apb", "axi", "wishbone", "pci", "i2c", "spi", "uart"]),
            features: vec![
                Feature::GdbServer,
                Feature::Monitor,
                Feature::Snapshot,
                Feature::Step,
                Feature::Coverage,
                Feature::TimeAdvance,
                Feature::EventInjection,
            ],
            boards: strings(&[
                "stm32f4_discovery",
                "stm32f746g_disco",
                "stm32f072b_disco",
                "nucleo_f103rb",
                "nucleo_l476rg",
                "nrf52840dk",
                "nrf52dk",
                "microbit",
                "hifive1",
                "hifive1_revb",
                "hifive_unleashed",
                "sam_e70_xplained",
                "polarfire_soc",
                "imxrt1064_evk",
                "k64f",
                "zedboard",
                "pico",
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

        let script = generate_script(&session.name, gdb_port, config);
        let script_path = std::env::temp_dir().join(format!("session-{}.resc", session.id));
        tokio::fs::write(&script_path, &script)
            .await
            .map_err(|e| Error::Spawn(format!("failed to write startup script: {e}")))?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--disable-gui")
            .arg("--port")
            .arg(telnet_port.to_string())
            .arg(&script_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if console.is_some() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to start renode: {e}")))?;

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
            "renode session started"
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.id.clone(),
            RenodeSession {
                child,
                gdb_port,
                monitor: MonitorChannel::new(telnet_port),
                script_path,
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
            .map_err(|e| Error::Internal(format!("failed to kill renode process: {e}")))?;
        let _ = tokio::fs::remove_file(&sess.script_path).await;
        info!(session_id, "renode session stopped");
        Ok(())
    }

    async fn reset_session(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("machine Reset").await
    }

    async fn load_program(&self, session_id: &str, program_path: &Path) -> Result<()> {
        let command = format!("sysbus LoadELF @{}", program_path.display());
        self.monitor(session_id).await?.send(&command).await
    }

    async fn execute(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("start").await
    }

    async fn pause(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("pause").await
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

    async fn create_snapshot(&self, session_id: &str, snapshot_path: &Path) -> Result<()> {
        let command = format!("save @{}", snapshot_path.display());
        self.monitor(session_id).await?.send(&command).await
    }

    async fn restore_snapshot(&self, session_id: &str, snapshot_path: &Path) -> Result<()> {
        let command = format!("load @{}", snapshot_path.display());
        self.monitor(session_id).await?.send(&command).await
    }

    async fn step(&self, session_id: &str, steps: u64) -> Result<()> {
        let command = format!("step {steps}");
        self.monitor(session_id).await?.send(&command).await
    }

    async fn start_coverage(&self, session_id: &str, output_path: &Path) -> Result<()> {
        let command = format!("cpu LogCoverage @{}", output_path.display());
        self.monitor(session_id).await?.send(&command).await
    }

    async fn stop_coverage(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id)
            .await?
            .send("cpu DisableLogCoverage")
            .await
    }

    async fn run_for(
        &self,
        session_id: &str,
        duration: Duration,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        // Native virtual-time advance; no resume/sleep/pause dance.
        let command = format!("machine Advance {}", format_advance(duration));
        self.monitor(session_id).await?.send(&command).await
    }

    async fn inject_event(&self, session_id: &str, event: &InjectEvent) -> Result<()> {
        let command = match event {
            InjectEvent::Gpio { port, pin, state } => {
                format!("{port}.{pin} SetState {state}")
            }
            InjectEvent::Uart { device, text } => {
                format!("{device} WriteString \"{text}\"")
            }
            other => {
                return Err(Error::Unsupported {
                    backend: Backend::Renode,
                    operation: other.kind(),
                })
            }
        };
        self.monitor(session_id).await?.send(&command).await
    }
}
