//! QEMU full-system emulator adapter.
//!
//! The child is launched paused (`-S`) with a gdb server and a text
//! monitor on allocated loopback ports. Control goes through monitor
//! text commands; program load is the one operation that shells out,
//! driving an external `gdb` in batch mode against the debug port.
//! Coverage is indirect: the child runs with semihosting enabled and a
//! per-session working directory, and the firmware itself writes
//! coverage data there.

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
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Machine used when neither a board nor a mappable processor is given.
const DEFAULT_MACHINE: &str = "netduino2";

/// External debugger used for batch program load.
const GDB_BINARY: &str = "gdb";

struct QemuSession {
    child: Child,
    gdb_port: u16,
    monitor: MonitorChannel,
    /// Semihosting output (e.g. gcda files) lands here.
    work_dir: PathBuf,
}

/// Adapter for QEMU system emulation.
pub struct QemuAdapter {
    binary: String,
    work_root: PathBuf,
    sessions: RwLock<HashMap<String, QemuSession>>,
}

impl QemuAdapter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            work_root: std::env::temp_dir(),
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

/// Map a board configuration to a QEMU machine name.
fn select_machine(config: &BoardConfig) -> String {
    if let Some(board) = config.board.as_deref() {
        if !board.is_empty() {
            return board.to_string();
        }
    }
    match config.processor.model.as_str() {
        "cortex-m3" => "lm3s6965evb",
        "cortex-m4" => "netduino2",
        "riscv32" | "riscv64" => "virt",
        "aarch64" | "cortex-a53" | "cortex-a57" => "virt",
        _ => DEFAULT_MACHINE,
    }
    .to_string()
}

/// Build the QEMU command line for one session.
fn build_args(gdb_port: u16, monitor_port: u16, config: &BoardConfig) -> Vec<String> {
    let mut args = vec![
        "-nographic".to_string(),
        "-gdb".to_string(),
        format!("tcp::{gdb_port}"),
        "-monitor".to_string(),
        format!("tcp:127.0.0.1:{monitor_port},server,nowait"),
        // Start paused; execution is driven through the monitor.
        "-S".to_string(),
        // Firmware writes coverage data through semihosting.
        "-semihosting-config".to_string(),
        "enable=on,target=native".to_string(),
    ];

    let machine = select_machine(config);
    args.push("-M".to_string());
    args.push(machine.clone());

    // Generic machines accept an explicit CPU model.
    if !config.processor.model.is_empty() && (machine == "virt" || machine == "versatilepb") {
        args.push("-cpu".to_string());
        args.push(config.processor.model.clone());
    }

    if config.memory.ram.size > 0 {
        args.push("-m".to_string());
        args.push(format!("{}M", config.memory.ram.size / (1024 * 1024)));
    }

    for (i, peripheral) in config.peripherals.iter().enumerate() {
        if peripheral.kind == "ethernet" || peripheral.kind == "virtio-net" {
            let net_id = format!("net{i}");
            args.push("-netdev".to_string());
            args.push(format!("user,id={net_id}"));
            args.push("-device".to_string());
            args.push(format!("virtio-net-device,netdev={net_id}"));
        }
    }

    args
}

#[async_trait]
impl BackendAdapter for QemuAdapter {
    fn capabilities(&self) -> Capability {
        Capability {
            backend: Backend::Qemu,
            processors: strings(&[
                "cortex-m0",
                "cortex-m3",
                "cortex-m4",
                "cortex-m7",
                "cortex-m33",
                "cortex-a7",
                "cortex-a8",
                "cortex-a9",
                "cortex-a15",
                "cortex-a53",
                "cortex-a57",
                "cortex-a72",
                "arm926",
                "arm1136",
                "riscv32",
                "riscv64",
                "sifive-e31",
                "sifive-u54",
                "i386",
                "x86_64",
            ]),
            peripherals: strings(&[
                "uart",
                "pl011",
                "16550a",
                "gpio",
                "pl061",
                "spi",
                "ssi",
                "i2c",
                "timer",
                "sp804",
                "adc",
                "ethernet",
                "smc91c111",
                "lan9118",
                "e1000",
                "virtio-net",
                "display",
                "pl110",
                "sd",
                "pl181",
                "sdhci",
                "usb",
                "virtio-blk",
                "virtio-rng",
            ]),
            bus_types: strings(&["ahb", "apb", "axi", "pci", "pcie", "usb", "i2c", "spi"]),
            features: vec![
                Feature::GdbServer,
                Feature::Monitor,
                Feature::Snapshot,
                Feature::Coverage,
                Feature::TimeAdvance,
                Feature::EventInjection,
            ],
            boards: strings(&[
                "versatilepb",
                "vexpress-a9",
                "realview-eb",
                "integratorcp",
                "mps2-an385",
                "mps2-an500",
                "mps2-an511",
                "stm32vldiscovery",
                "netduino2",
                "netduinoplus2",
                "microbit",
                "raspi2",
                "raspi3",
                "virt",
                "sifive_e",
                "sifive_u",
                "spike",
                "pc",
                "q35",
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
        let (gdb_port, monitor_port) = port::alloc_port_pair()
            .map_err(|e| Error::Spawn(format!("port allocation failed: {e}")))?;

        let args = build_args(gdb_port, monitor_port, config);

        let work_dir = self.work_root.join(format!("qemu-session-{}", session.id));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| Error::Spawn(format!("failed to create session work dir: {e}")))?;

        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if console.is_some() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to start qemu: {e}")))?;

        if let Some(sink) = &console {
            wire_console(&mut child, sink);
        }
        abort_start_if_cancelled(&mut child, cancel).await?;

        let pid = child.id().unwrap_or(0);
        info!(
            session_id = %session.id,
            gdb_port,
            monitor_port,
            pid,
            "qemu session started"
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.id.clone(),
            QemuSession {
                child,
                gdb_port,
                monitor: MonitorChannel::new(monitor_port),
                work_dir,
            },
        );

        session.gdb_port = gdb_port;
        session.monitor_port = monitor_port;
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
            .map_err(|e| Error::Internal(format!("failed to kill qemu process: {e}")))?;
        info!(session_id, "qemu session stopped");
        Ok(())
    }

    async fn reset_session(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("system_reset").await
    }

    async fn load_program(&self, session_id: &str, program_path: &Path) -> Result<()> {
        let gdb_port = self.gdb_port(session_id).await?;

        let script = format!(
            "target remote localhost:{gdb_port}\nload {}\nquit\n",
            program_path.display()
        );
        let script_path = std::env::temp_dir().join(format!("load-{session_id}.gdb"));
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| Error::Internal(format!("failed to write gdb script: {e}")))?;

        let output = Command::new(GDB_BINARY)
            .arg("-batch")
            .arg("-x")
            .arg(&script_path)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&script_path).await;

        let output =
            output.map_err(|e| Error::Transport(format!("failed to run {GDB_BINARY}: {e}")))?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "gdb load failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!(session_id, program = %program_path.display(), "program loaded via gdb");
        Ok(())
    }

    async fn execute(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("cont").await
    }

    async fn pause(&self, session_id: &str) -> Result<()> {
        self.monitor(session_id).await?.send("stop").await
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
        let command = format!("savevm {}", snapshot_path.display());
        self.monitor(session_id).await?.send(&command).await
    }

    async fn restore_snapshot(&self, session_id: &str, snapshot_path: &Path) -> Result<()> {
        let command = format!("loadvm {}", snapshot_path.display());
        self.monitor(session_id).await?.send(&command).await
    }

    async fn step(&self, _session_id: &str, _steps: u64) -> Result<()> {
        // The monitor has no instruction-step command; stepping needs a
        // live gdb connection, which this adapter does not hold.
        Err(Error::Unsupported {
            backend: Backend::Qemu,
            operation: "step",
        })
    }

    async fn start_coverage(&self, session_id: &str, output_path: &Path) -> Result<()> {
        // Semihosting is already enabled at launch; the firmware writes
        // into the session work dir on its own.
        let sessions = self.sessions.read().await;
        let sess = sessions
            .get(session_id)
            .ok_or_else(|| Error::session_not_found(session_id))?;
        debug!(
            session_id,
            work_dir = %sess.work_dir.display(),
            output = %output_path.display(),
            "coverage collection is firmware-driven for qemu"
        );
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
        resume_sleep_pause(&monitor, "cont", "stop", duration, cancel).await
    }

    async fn inject_event(&self, session_id: &str, event: &InjectEvent) -> Result<()> {
        let monitor = self.monitor(session_id).await?;
        let command = match event {
            InjectEvent::Key { key } => format!("sendkey {key}"),
            InjectEvent::MouseMove { dx, dy } => format!("mouse_move {dx} {dy}"),
            other => {
                return Err(Error::Unsupported {
                    backend: Backend::Qemu,
                    operation: other.kind(),
                })
            }
        };
        monitor.send(&command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryConfig, MemoryRegion, PeripheralConfig, ProcessorConfig};

    #[test]
    fn board_name_wins_over_processor_mapping() {
        let config = BoardConfig {
            board: Some("mps2-an385".to_string()),
            processor: ProcessorConfig {
                model: "cortex-m3".to_string(),
                frequency: 0,
            },
            ..Default::default()
        };
        assert_eq!(select_machine(&config), "mps2-an385");

        let config = BoardConfig {
            processor: ProcessorConfig {
                model: "cortex-m3".to_string(),
                frequency: 0,
            },
            ..Default::default()
        };
        assert_eq!(select_machine(&config), "lm3s6965evb");

        assert_eq!(select_machine(&BoardConfig::default()), DEFAULT_MACHINE);
    }

    #[test]
    fn args_wire_ports_and_start_paused() {
        let config = BoardConfig {
            processor: ProcessorConfig {
                model: "riscv32".to_string(),
                frequency: 0,
            },
            memory: MemoryConfig {
                flash: MemoryRegion::default(),
                ram: MemoryRegion {
                    base: 0x8000_0000,
                    size: 64 * 1024 * 1024,
                },
            },
            ..Default::default()
        };

        let args = build_args(4101, 4102, &config);
        assert!(args.contains(&"tcp::4101".to_string()));
        assert!(args.contains(&"tcp:127.0.0.1:4102,server,nowait".to_string()));
        assert!(args.contains(&"-S".to_string()));
        // riscv32 maps to the generic machine, which takes an explicit CPU.
        let machine_idx = args.iter().position(|a| a == "-M").unwrap();
        assert_eq!(args[machine_idx + 1], "virt");
        let cpu_idx = args.iter().position(|a| a == "-cpu").unwrap();
        assert_eq!(args[cpu_idx + 1], "riscv32");
        let mem_idx = args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(args[mem_idx + 1], "64M");
    }

    #[test]
    fn ethernet_peripherals_get_user_networking() {
        let config = BoardConfig {
            peripherals: vec![PeripheralConfig {
                kind: "virtio-net".to_string(),
                name: "eth0".to_string(),
                address: 0,
                irq: None,
            }],
            ..Default::default()
        };

        let args = build_args(1, 2, &config);
        assert!(args.contains(&"user,id=net0".to_string()));
        assert!(args.contains(&"virtio-net-device,netdev=net0".to_string()));
    }

    #[test]
    fn capabilities_exclude_step() {
        let caps = QemuAdapter::new("qemu-system-arm").capabilities();
        assert_eq!(caps.backend, Backend::Qemu);
        assert!(caps.supports(Feature::Snapshot));
        assert!(caps.supports(Feature::EventInjection));
        // Time advance is the resume/sleep/pause approximation.
        assert!(caps.supports(Feature::TimeAdvance));
        assert!(!caps.supports(Feature::Step));
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let adapter = QemuAdapter::new("qemu-system-arm");
        let err = adapter.reset_session("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(..)));

        let err = adapter.stop_session("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(..)));
    }

    #[tokio::test]
    async fn step_is_explicitly_unsupported() {
        let adapter = QemuAdapter::new("qemu-system-arm");
        let err = adapter.step("any", 100).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                backend: Backend::Qemu,
                operation: "step",
            }
        ));
    }
}
