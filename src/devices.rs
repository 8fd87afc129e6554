//! Device addressing, the receive-side handler seam, and the concrete field
//! devices attached to the plant topology.
//!
//! Each device is a [`DeviceHandler`] registered under its [`DeviceKey`].
//! Handlers share a [`PointStore`]: the BMS internal-sample cache and the
//! front-end register-poll cache live there so the topology can build reports
//! from what actually arrived over the bus, not from ground truth.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::protocol::{modbus, station_bus, telecontrol, CommStatus, Direction, LinkProtocol};

pub const REGISTER_BANK_WORDS: usize = 6;

// Byte count of a full-bank response must fit the count byte.
static_assertions::const_assert!(REGISTER_BANK_WORDS * 2 <= u8::MAX as usize);

/// Kind of field device attached to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Battery,
    Bms,
    Pcs,
    Ccu,
    FrontEnd,
    Ems,
    Remote,
}

impl core::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DeviceKind::Battery => write!(f, "battery"),
            DeviceKind::Bms => write!(f, "bms"),
            DeviceKind::Pcs => write!(f, "pcs"),
            DeviceKind::Ccu => write!(f, "ccu"),
            DeviceKind::FrontEnd => write!(f, "frontend"),
            DeviceKind::Ems => write!(f, "ems"),
            DeviceKind::Remote => write!(f, "remote"),
        }
    }
}

/// Stable address of one device instance, e.g. `bms-3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub kind: DeviceKind,
    pub id: u8,
}

impl DeviceKey {
    pub fn new(kind: DeviceKind, id: u8) -> Self {
        Self { kind, id }
    }
}

impl core::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.kind, self.id)
    }
}

/// Delivery context passed to the receiving device handler.
#[derive(Debug)]
pub struct InboundMessage<'a> {
    pub ts: u64,
    pub link_key: &'a str,
    pub protocol: LinkProtocol,
    pub from: DeviceKey,
    pub to: DeviceKey,
    pub direction: Direction,
    pub payload: &'a [u8],
    pub latency_ms: u32,
    pub corrupted: bool,
}

/// Synchronous reply a handler wants sent back over the same link.
#[derive(Debug, Clone)]
pub struct Reply {
    pub payload: Vec<u8>,
    pub summary: String,
}

/// Result of delivering a message to a device handler.
#[derive(Debug, Clone)]
pub struct ReceiveOutcome {
    pub ok: bool,
    pub status: CommStatus,
    pub error: Option<String>,
    pub reply: Option<Reply>,
}

impl ReceiveOutcome {
    pub fn accepted(status: CommStatus) -> Self {
        Self {
            ok: true,
            status,
            error: None,
            reply: None,
        }
    }

    pub fn rejected(status: CommStatus, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            error: Some(error.into()),
            reply: None,
        }
    }

    pub fn with_reply(mut self, payload: Vec<u8>, summary: impl Into<String>) -> Self {
        self.reply = Some(Reply {
            payload,
            summary: summary.into(),
        });
        self
    }
}

pub trait DeviceHandler {
    fn receive(&mut self, msg: &InboundMessage<'_>, points: &mut PointStore) -> ReceiveOutcome;
}

/// Handler map plus the caches the handlers share.
pub struct DeviceRegistry {
    handlers: BTreeMap<DeviceKey, alloc::boxed::Box<dyn DeviceHandler + Send>>,
    pub points: PointStore,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            points: PointStore::new(),
        }
    }

    pub fn register(&mut self, key: DeviceKey, handler: alloc::boxed::Box<dyn DeviceHandler + Send>) {
        self.handlers.insert(key, handler);
    }

    pub fn is_registered(&self, key: DeviceKey) -> bool {
        self.handlers.contains_key(&key)
    }

    /// Delivers to the addressed handler, or `None` when the target has no
    /// handler on the bus.
    pub fn receive(&mut self, msg: &InboundMessage<'_>) -> Option<ReceiveOutcome> {
        let handler = self.handlers.get_mut(&msg.to)?;
        Some(handler.receive(msg, &mut self.points))
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeState {
    Charging,
    Discharging,
    #[default]
    Idle,
}

impl ChargeState {
    pub fn from_current(current_a: f64) -> Self {
        if current_a > 0.0 {
            ChargeState::Charging
        } else if current_a < 0.0 {
            ChargeState::Discharging
        } else {
            ChargeState::Idle
        }
    }
}

/// Electrical sample for one unit as seen on a link. `soh` is a 0..1
/// fraction; `power_w` is signed-magnitude watts.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitTelemetry {
    pub voltage_v: f64,
    pub current_a: f64,
    pub temperature_c: f64,
    pub soc_pct: f64,
    pub soh: f64,
    pub power_w: f64,
    pub charging: ChargeState,
}

/// Body of the internal-bus push from a battery rack to its BMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalSample {
    pub telemetry: UnitTelemetry,
}

/// Business status the topology pins on each unit before a tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UnitStatuses {
    #[serde(default)]
    pub unit: Option<CommStatus>,
    #[serde(default)]
    pub bms: Option<CommStatus>,
}

/// Shared point caches. `battery_latest` is what each BMS last heard from its
/// rack; `bms_latest` is what the front-end last decoded from register polls.
#[derive(Debug, Default)]
pub struct PointStore {
    pub battery_latest: BTreeMap<u8, UnitTelemetry>,
    pub bms_latest: BTreeMap<u8, UnitTelemetry>,
    pub unit_statuses: BTreeMap<u8, UnitStatuses>,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unit_status(&self, unit_id: u8) -> CommStatus {
        self.unit_statuses
            .get(&unit_id)
            .and_then(|s| s.unit)
            .unwrap_or(CommStatus::Normal)
    }

    fn bms_status(&self, unit_id: u8) -> CommStatus {
        self.unit_statuses
            .get(&unit_id)
            .and_then(|s| s.bms)
            .unwrap_or(CommStatus::Normal)
    }
}

/// Register map of one BMS (all u16, big-endian on the wire):
/// 0 voltage ×10 V, 1 current ×10 A two's complement, 2 temperature °C,
/// 3 SOC %, 4 SOH ×1000, 5 power ×10 kW.
pub fn encode_register_bank(t: &UnitTelemetry) -> [u16; REGISTER_BANK_WORDS] {
    #[allow(clippy::cast_possible_truncation)]
    fn word(v: f64) -> u16 {
        (v.round() as i64 & 0xFFFF) as u16
    }
    [
        word(t.voltage_v * 10.0),
        modbus::register_from_signed(clamp_i32(t.current_a * 10.0)),
        word(t.temperature_c),
        word(t.soc_pct),
        word(t.soh * 1000.0),
        word((t.power_w / 1000.0) * 10.0),
    ]
}

#[allow(clippy::cast_possible_truncation)]
fn clamp_i32(v: f64) -> i32 {
    v.round() as i32
}

/// Inverse of [`encode_register_bank`]. Power is recomputed from voltage and
/// current, so word 5 is informational only.
pub fn decode_register_bank(words: &[u16]) -> UnitTelemetry {
    let at = |i: usize| -> u16 { words.get(i).copied().unwrap_or(0) };
    let voltage_v = f64::from(at(0)) / 10.0;
    let current_a = f64::from(modbus::register_to_signed(at(1))) / 10.0;
    UnitTelemetry {
        voltage_v,
        current_a,
        temperature_c: f64::from(at(2)),
        soc_pct: f64::from(at(3)),
        soh: f64::from(at(4)) / 1000.0,
        power_w: (voltage_v * current_a).abs(),
        charging: ChargeState::from_current(current_a),
    }
}

/// Battery rack: pushes internal samples, never answers anything.
pub struct BatteryRack;

impl DeviceHandler for BatteryRack {
    fn receive(&mut self, _msg: &InboundMessage<'_>, _points: &mut PointStore) -> ReceiveOutcome {
        ReceiveOutcome::accepted(CommStatus::Normal)
    }
}

/// BMS: caches internal samples and serves its register bank over the poll
/// link.
pub struct BmsDevice {
    unit_id: u8,
}

impl BmsDevice {
    pub fn new(unit_id: u8) -> Self {
        Self { unit_id }
    }

    fn receive_internal(&self, msg: &InboundMessage<'_>, points: &mut PointStore) -> ReceiveOutcome {
        if msg.corrupted {
            return ReceiveOutcome::rejected(CommStatus::Warning, "internal_corrupted");
        }
        match serde_json::from_slice::<InternalSample>(msg.payload) {
            Ok(sample) => {
                points.battery_latest.insert(self.unit_id, sample.telemetry);
                ReceiveOutcome::accepted(points.unit_status(self.unit_id))
            }
            Err(e) => ReceiveOutcome::rejected(CommStatus::Error, e.to_string()),
        }
    }

    fn receive_poll(&self, msg: &InboundMessage<'_>, points: &mut PointStore) -> ReceiveOutcome {
        let req = match modbus::decode_read_request(msg.payload) {
            Ok(req) => req,
            Err(e) => return ReceiveOutcome::rejected(CommStatus::Error, e.to_string()),
        };
        let telemetry = points
            .battery_latest
            .get(&self.unit_id)
            .copied()
            .unwrap_or_default();
        let bank = encode_register_bank(&telemetry);
        let start = req.start as usize;
        let end = core::cmp::min(start.saturating_add(req.quantity as usize), bank.len());
        let values: Vec<u16> = if start < bank.len() {
            bank[start..end].to_vec()
        } else {
            Vec::new()
        };
        let words = values.len();
        let response = modbus::Response::Values {
            transaction_id: req.transaction_id,
            unit_id: req.unit_id,
            values,
        };
        ReceiveOutcome::accepted(points.bms_status(self.unit_id)).with_reply(
            modbus::encode_response(&response),
            format!("ReadHoldingRegsResp unit={} words={words}", self.unit_id),
        )
    }
}

impl DeviceHandler for BmsDevice {
    fn receive(&mut self, msg: &InboundMessage<'_>, points: &mut PointStore) -> ReceiveOutcome {
        match msg.protocol {
            LinkProtocol::InternalBus => self.receive_internal(msg, points),
            LinkProtocol::ModbusTcp => self.receive_poll(msg, points),
            _ => ReceiveOutcome::rejected(CommStatus::Error, "unsupported_protocol"),
        }
    }
}

/// PCS: present on the station bus, report-only for now.
pub struct PcsDevice;

impl DeviceHandler for PcsDevice {
    fn receive(&mut self, _msg: &InboundMessage<'_>, _points: &mut PointStore) -> ReceiveOutcome {
        ReceiveOutcome::accepted(CommStatus::Normal)
    }
}

/// CCU: receives station-bus command downlinks.
pub struct CcuDevice;

impl DeviceHandler for CcuDevice {
    fn receive(&mut self, msg: &InboundMessage<'_>, _points: &mut PointStore) -> ReceiveOutcome {
        if msg.protocol != LinkProtocol::Iec61850 {
            return ReceiveOutcome::rejected(CommStatus::Error, "bad_protocol");
        }
        if msg.corrupted {
            return ReceiveOutcome::rejected(CommStatus::Warning, "corrupted");
        }
        match station_bus::decode_message(msg.payload) {
            Ok(_) => ReceiveOutcome::accepted(CommStatus::Normal),
            Err(e) => ReceiveOutcome::rejected(CommStatus::Error, e.to_string()),
        }
    }
}

/// Front-end server: decodes register-poll responses into the poll cache and
/// accepts station-bus reports from PCS and CCU devices.
pub struct FrontEndServer;

impl DeviceHandler for FrontEndServer {
    fn receive(&mut self, msg: &InboundMessage<'_>, points: &mut PointStore) -> ReceiveOutcome {
        match msg.protocol {
            LinkProtocol::ModbusTcp => match modbus::decode_response(msg.payload) {
                Ok(modbus::Response::Values { unit_id, values, .. }) => {
                    points.bms_latest.insert(unit_id, decode_register_bank(&values));
                    ReceiveOutcome::accepted(CommStatus::Normal)
                }
                Ok(modbus::Response::Exception { .. }) => {
                    ReceiveOutcome::rejected(CommStatus::Warning, "modbus_exception")
                }
                Err(e) => ReceiveOutcome::rejected(CommStatus::Error, e.to_string()),
            },
            LinkProtocol::Iec61850 => match station_bus::decode_message(msg.payload) {
                Ok(_) => ReceiveOutcome::accepted(CommStatus::Normal),
                Err(e) => ReceiveOutcome::rejected(CommStatus::Error, e.to_string()),
            },
            _ => ReceiveOutcome::rejected(CommStatus::Error, "unsupported_protocol"),
        }
    }
}

/// EMS: receives the station-bus aggregate report.
pub struct EmsGateway;

impl DeviceHandler for EmsGateway {
    fn receive(&mut self, msg: &InboundMessage<'_>, _points: &mut PointStore) -> ReceiveOutcome {
        if msg.protocol != LinkProtocol::Iec61850 {
            return ReceiveOutcome::rejected(CommStatus::Error, "bad_protocol");
        }
        match station_bus::decode_message(msg.payload) {
            Ok(_) => ReceiveOutcome::accepted(CommStatus::Normal),
            Err(e) => ReceiveOutcome::rejected(CommStatus::Error, e.to_string()),
        }
    }
}

/// Remote dispatch master: receives telecontrol uplinks.
pub struct RemoteMaster;

impl DeviceHandler for RemoteMaster {
    fn receive(&mut self, msg: &InboundMessage<'_>, _points: &mut PointStore) -> ReceiveOutcome {
        if msg.protocol != LinkProtocol::Iec104 {
            return ReceiveOutcome::rejected(CommStatus::Error, "bad_protocol");
        }
        match telecontrol::decode_frame(msg.payload) {
            Ok(_) => ReceiveOutcome::accepted(CommStatus::Normal),
            Err(e) => ReceiveOutcome::rejected(CommStatus::Error, e.to_string()),
        }
    }
}
