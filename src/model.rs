//! Data model for sessions, programs, snapshots and co-simulation groups.
//!
//! Records are serializable for API responses and for the durable store.
//! The board configuration is serialized verbatim into the session record
//! at creation and treated as opaque by the core afterwards; only adapters
//! interpret its fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Simulation/debug backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Full-system emulator driven through its text monitor (QMP-class).
    Qemu,
    /// Full-system emulator driven through a script/telnet monitor.
    Renode,
    /// Hardware-debug daemon bound to a physical probe.
    Openocd,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Qemu => "qemu",
            Backend::Renode => "renode",
            Backend::Openocd => "openocd",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a simulation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A controllable handle to one running backend instance.
///
/// The identifier and backend tag are immutable for the record's life.
/// Debug/monitor ports are non-zero exactly while the child is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub backend: Backend,
    /// Board configuration serialized as JSON at creation, opaque after.
    #[serde(default)]
    pub board_config: String,
    pub state: SessionState,
    #[serde(default)]
    pub gdb_port: u16,
    #[serde(default)]
    pub monitor_port: u16,
    #[serde(default)]
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Declarative hardware target description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Predefined board name; takes precedence over the processor model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peripherals: Vec<PeripheralConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// e.g. "cortex-m3", "cortex-m4", "riscv32".
    #[serde(default)]
    pub model: String,
    /// Clock frequency in Hz.
    #[serde(default)]
    pub frequency: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub flash: MemoryRegion,
    #[serde(default)]
    pub ram: MemoryRegion,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryRegion {
    #[serde(default)]
    pub base: u64,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// e.g. "uart", "gpio", "ethernet".
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub address: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub irq: Option<u32>,
}

/// Firmware image formats accepted by program upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramFormat {
    Elf,
    Binary,
    Hex,
}

/// An uploaded firmware image, content-addressed by SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: String,
    pub name: String,
    pub format: ProgramFormat,
    pub size: u64,
    pub path: PathBuf,
    /// Hex-encoded SHA-256 of the stored content.
    pub hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// An opaque per-backend state capture. Validity and format are the
/// owning backend's concern; the record is meaningful only while the
/// owning session exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Feature flags advertised by an adapter and consulted by the service
/// before dispatch, so unsupported operations fail at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    GdbServer,
    Monitor,
    Snapshot,
    Step,
    Coverage,
    /// Advance the target by a time span, natively or through the
    /// resume/sleep/pause approximation.
    TimeAdvance,
    EventInjection,
    FlashProgramming,
}

/// Static per-adapter capability descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct Capability {
    pub backend: Backend,
    pub processors: Vec<String>,
    pub peripherals: Vec<String>,
    pub bus_types: Vec<String>,
    pub features: Vec<Feature>,
    pub boards: Vec<String>,
}

impl Capability {
    pub fn supports(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Out-of-band stimulus applied to a running target.
///
/// Payloads are typed per event kind; adapters reject kinds they do not
/// implement with an unsupported error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InjectEvent {
    /// Drive a GPIO line, e.g. `gpioPortA` pin 4 high.
    Gpio { port: String, pin: u32, state: bool },
    /// Feed text into a UART device, e.g. `sysbus.uart0`.
    Uart { device: String, text: String },
    /// Send a key chord through the emulator's input layer.
    Key { key: String },
    /// Relative pointer motion through the emulator's input layer.
    MouseMove { dx: i32, dy: i32 },
}

impl InjectEvent {
    /// Stable kind tag, matching the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            InjectEvent::Gpio { .. } => "gpio",
            InjectEvent::Uart { .. } => "uart",
            InjectEvent::Key { .. } => "key",
            InjectEvent::MouseMove { .. } => "mouse_move",
        }
    }
}

/// Status of a co-simulation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CosimStatus {
    Created,
    Running,
    Stopped,
}

/// Status of a member within a co-simulation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Initialized,
}

/// A grouping of sessions driven together under one synchronization
/// scheme. `sync_count` and `time_ns` accumulate monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosimSession {
    pub id: String,
    pub status: CosimStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub sync_count: u64,
    pub time_ns: u64,
    pub members: Vec<CosimMember>,
}

/// A constituent of a co-simulation group. A member without a bound
/// session is a dispatch no-op but still participates in counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosimMember {
    pub id: String,
    pub cosim_id: String,
    pub backend: Backend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Opaque per-member configuration blob.
    #[serde(default)]
    pub config: String,
    pub status: MemberStatus,
}

/// Caller-supplied description of a member at group creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CosimMemberSpec {
    pub backend: Backend,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub config: String,
}

/// Persisted trace of a control-plane action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_id: String,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub details: String,
    pub ip: String,
    pub timestamp: DateTime<Utc>,
}
