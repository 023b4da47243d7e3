//! benchd: unified control plane for embedded-target simulation and
//! debug backends.
//!
//! One service fronts several backend engines (full-system emulators
//! with internal monitor interfaces, hardware-debug daemons bound to
//! physical probes) and exposes a consistent contract over them: create
//! a session, configure the target board, load a firmware image, drive
//! power and execution, take and restore snapshots, collect coverage and
//! stream console output. Groups of sessions can be driven together as a
//! co-simulation using instruction-step fan-out, parallel time slices or
//! targeted event injection.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     SessionService                        │
//! │  create/list/get/delete · power/reset · load · snapshot   │
//! │  coverage · co-simulation (step / time / event)           │
//! │                                                           │
//! │  index: live sessions        store: durable records       │
//! │  adapters: qemu/renode/openocd     hub: console fan-out   │
//! └───────────────────────────────────────────────────────────┘
//!          │ spawn + monitor commands            │ frames
//!          ▼                                     ▼
//! ┌──────────────┐ ┌──────────────┐      ┌──────────────┐
//! │ qemu child   │ │ renode child │ ...  │ subscribers  │
//! │ gdb: 41xxx   │ │ gdb: 42xxx   │      │ (bounded     │
//! │ monitor tcp  │ │ telnet tcp   │      │  queues)     │
//! └──────────────┘ └──────────────┘      └──────────────┘
//! ```
//!
//! Each session owns one child process and two allocated loopback ports
//! (debug bridge and monitor). Control commands travel over short-lived
//! monitor connections, one per command. Child stdout/stderr is copied
//! into the console hub and fanned out per session.

pub mod adapter;
pub mod config;
pub mod console;
pub mod error;
pub mod model;
pub mod monitor;
pub mod port;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use adapter::{BackendAdapter, OpenocdAdapter, QemuAdapter, RenodeAdapter};
pub use config::Config;
pub use console::{ConsoleHub, ConsoleSink, Frame, Subscription};
pub use error::{Error, Resource, Result};
pub use model::{
    Backend, BoardConfig, Capability, CosimMember, CosimMemberSpec, CosimSession, CosimStatus,
    Feature, InjectEvent, Program, ProgramFormat, SessionRecord, SessionState, Snapshot,
};
pub use service::SessionService;
pub use store::{MemStore, Store};
