//! # Plant Bus
//!
//! Control-and-telemetry core of a battery energy-storage plant monitor:
//! a deterministic virtual field bus, per-unit fault latching, protection
//! devices, and the EMS decision loop that drives station power and voltage
//! targets.
//!
//! ## Features
//!
//! - **Virtual field bus**: named links with drop, corruption, and latency
//!   impairment; every transfer leaves an auditable frame record
//! - **Three wire codecs**: register polls (Modbus TCP flavoured), station-bus
//!   dataset reports (IEC 61850 flavoured), telecontrol I-frames (IEC 104
//!   flavoured)
//! - **Fault latching**: sticky per-unit latches with warning/critical bands,
//!   reset cooldown, and alarm/notification streams
//! - **Protection devices**: five named devices with sticky trips and an
//!   explicit reset path
//! - **EMS decisions**: readiness, mode, and clamped power targets, plus an
//!   autonomous power/voltage engine with smoothstep health derating
//! - **Deterministic**: one seedable LCG drives every random draw
//!
//! ## Quick Start
//!
//! ```rust
//! use plantbus::StationAgent;
//!
//! let mut agent = StationAgent::new();
//!
//! // One simulation step: field traffic, latch scan, EMS decision.
//! let report = agent.tick(1_700_000_000_000);
//! println!("frames={} mode={:?}", report.frames.len(), report.ems.mode);
//! ```
//!
//! ## Architecture
//!
//! - [`station`] - Main orchestrator and public API
//! - [`topology`] - Device graph and the fixed tick exchange schedule
//! - [`bus`] - Virtual bus with impairment and frame records
//! - [`devices`] - Device handlers and shared point caches
//! - [`protocol`] - Wire codecs for the three field protocols
//! - [`latch`] - Per-unit fault latching and alarm streams
//! - [`protection`] - Protection devices and the EMS dispatch decision
//! - [`autopower`] - Autonomous power/voltage engine and takeover policy
//! - [`command`] - Authoritative control commands and audit log
//! - [`plant`] - Battery-unit plant model and coordination snapshots
//! - [`store`] - Snapshot persistence seam and in-memory store

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::float_cmp)]

extern crate alloc;

pub mod autopower;
pub mod bus;
pub mod command;
pub mod devices;
pub mod latch;
pub mod plant;
pub mod protection;
pub mod protocol;
pub mod station;
pub mod store;
pub mod topology;

pub use autopower::{AutoPowerConfig, AutoPowerDecision, MarketDataProvider, NullMarketDataProvider};
pub use bus::{FrameRecord, LinkDef, SimRng, VirtualBus};
pub use command::{CommandStore, ControlCommands};
pub use devices::{DeviceKey, DeviceKind, UnitTelemetry};
pub use latch::{AlarmOccurrence, LatchStore, OperatorNotification};
pub use plant::{BatteryUnit, CoordinationUnit, PlantState};
pub use protection::{EmsDecision, ProtectionDevice, TripLatchStore};
pub use protocol::{CommStatus, Direction, LinkProtocol};
pub use station::{StationAgent, StationConfig, TickReport};
pub use store::{MemoryStore, SnapshotStore};
pub use topology::{TopologyConfig, TopologySimulator};
