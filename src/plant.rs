//! Plant model: the battery units behind the topology, their per-tick power
//! ramp, and the coordination-unit snapshots the EMS consumes.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::bus::FrameRecord;
use crate::command::ControlCommands;
use crate::devices::{ChargeState, DeviceKey, DeviceKind, UnitTelemetry};
use crate::latch::UnitReadings;
use crate::protection::SafetySignals;
use crate::protocol::CommStatus;

/// Power window of one unit's PCS.
pub const UNIT_MAX_KW: f64 = 180.0;

/// Fixed number of coordination units the plant is partitioned into.
pub const COORDINATION_UNIT_COUNT: u8 = 3;

/// Tracking error above which a unit reports limited execution.
const TRACKING_ERROR_LIMIT_KW: f64 = 80.0;

const MIN_RAMP_KW_PER_S: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    Running,
    Standby,
    Fault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmsReadings {
    pub status: CommStatus,
    pub soc_pct: f64,
    /// 0..1 fraction.
    pub soh: f64,
    pub temperature_c: f64,
    pub insulation_resistance_kohm: f64,
    pub delta_cell_voltage_mv: f64,
    pub max_cell_temp_c: f64,
    pub warning_count: u32,
    pub fault_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcsReadings {
    pub status: CommStatus,
    pub running_state: RunningState,
    pub temperature_c: f64,
    pub actual_kw: f64,
    pub target_kw: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryUnit {
    pub id: u8,
    pub name: String,
    pub status: CommStatus,
    pub voltage_v: f64,
    pub current_a: f64,
    pub bms: BmsReadings,
    pub pcs: PcsReadings,
    pub fault_reason: Option<String>,
    pub last_update_ms: u64,
}

impl BatteryUnit {
    /// Sample the rack pushes on the internal bus.
    pub fn telemetry(&self) -> UnitTelemetry {
        UnitTelemetry {
            voltage_v: self.voltage_v,
            current_a: self.current_a,
            temperature_c: self.bms.temperature_c,
            soc_pct: self.bms.soc_pct,
            soh: self.bms.soh,
            power_w: (self.voltage_v * self.current_a).abs(),
            charging: ChargeState::from_current(self.current_a),
        }
    }

    /// Worst-cell view the latch scan works from.
    pub fn readings(&self) -> UnitReadings {
        UnitReadings {
            insulation_resistance_kohm: self.bms.insulation_resistance_kohm,
            delta_cell_voltage_mv: self.bms.delta_cell_voltage_mv,
            max_cell_temp_c: self.bms.max_cell_temp_c,
            pcs_temperature_c: self.pcs.temperature_c,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.status == CommStatus::Error
            || self.bms.status == CommStatus::Error
            || self.pcs.status == CommStatus::Error
    }

    fn has_warning(&self) -> bool {
        self.status == CommStatus::Warning
            || self.bms.status == CommStatus::Warning
            || self.pcs.status == CommStatus::Warning
    }
}

#[derive(Debug)]
pub struct PlantState {
    units: Vec<BatteryUnit>,
}

impl PlantState {
    /// Builds `count` units with a deterministic nominal spread.
    pub fn new(count: u8) -> Self {
        let mut units = Vec::with_capacity(count as usize);
        for i in 1..=count {
            let spread = f64::from(i);
            units.push(BatteryUnit {
                id: i,
                name: format!("Battery unit {i}"),
                status: CommStatus::Normal,
                voltage_v: 748.0 + spread,
                current_a: 0.0,
                bms: BmsReadings {
                    status: CommStatus::Normal,
                    soc_pct: 55.0 + f64::from(i % 7),
                    soh: 0.975 - f64::from(i % 5) * 0.002,
                    temperature_c: 28.0 + f64::from(i % 4),
                    insulation_resistance_kohm: 520.0 - spread * 2.0,
                    delta_cell_voltage_mv: 22.0 + f64::from(i % 5),
                    max_cell_temp_c: 30.0 + f64::from(i % 3),
                    warning_count: 0,
                    fault_count: 0,
                },
                pcs: PcsReadings {
                    status: CommStatus::Normal,
                    running_state: RunningState::Standby,
                    temperature_c: 36.0 + f64::from(i % 6),
                    actual_kw: 0.0,
                    target_kw: 0.0,
                },
                fault_reason: None,
                last_update_ms: 0,
            });
        }
        Self { units }
    }

    pub fn units(&self) -> &[BatteryUnit] {
        &self.units
    }

    pub fn unit(&self, unit_id: u8) -> Option<&BatteryUnit> {
        self.units.iter().find(|u| u.id == unit_id)
    }

    pub fn unit_mut(&mut self, unit_id: u8) -> Option<&mut BatteryUnit> {
        self.units.iter_mut().find(|u| u.id == unit_id)
    }

    pub fn total_actual_kw(&self) -> f64 {
        self.units.iter().map(|u| u.pcs.actual_kw).sum()
    }

    pub fn average_soc_pct(&self) -> f64 {
        if self.units.is_empty() {
            return 0.0;
        }
        self.units.iter().map(|u| u.bms.soc_pct).sum::<f64>() / self.units.len() as f64
    }

    /// Unit with the lowest insulation reading.
    pub fn worst_insulation(&self) -> Option<(u8, f64)> {
        self.units
            .iter()
            .map(|u| (u.id, u.bms.insulation_resistance_kohm))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Moves each unit's PCS toward its share of the station target.
    /// Faulted units pin to zero. Ramp rate is proportional to the distance,
    /// floored so small errors still close.
    pub fn step(&mut self, station_target_kw: f64, dt_ms: u64, ts: u64) {
        let count = self.units.len().max(1) as f64;
        let per_unit = (station_target_kw / count).clamp(-UNIT_MAX_KW, UNIT_MAX_KW);
        let dt_s = dt_ms as f64 / 1000.0;
        for unit in &mut self.units {
            let target = if unit.is_faulted() { 0.0 } else { per_unit };
            unit.pcs.target_kw = target;
            let delta = target - unit.pcs.actual_kw;
            let rate = (delta.abs() / 20.0).max(MIN_RAMP_KW_PER_S);
            let step = delta.clamp(-rate * dt_s, rate * dt_s);
            unit.pcs.actual_kw += step;
            if unit.pcs.actual_kw.abs() < 1e-6 {
                unit.pcs.actual_kw = 0.0;
            }
            unit.pcs.running_state = if unit.is_faulted() {
                RunningState::Fault
            } else if unit.pcs.actual_kw == 0.0 {
                RunningState::Standby
            } else {
                RunningState::Running
            };
            unit.current_a = unit.pcs.actual_kw * 1000.0 / unit.voltage_v;
            unit.last_update_ms = ts;
        }
    }

    /// Pins a latched unit into its fault shape.
    pub fn apply_latch(&mut self, unit_id: u8, description: &str) {
        if let Some(unit) = self.unit_mut(unit_id) {
            unit.status = CommStatus::Error;
            unit.bms.status = CommStatus::Error;
            unit.pcs.status = CommStatus::Error;
            unit.pcs.running_state = RunningState::Fault;
            unit.bms.fault_count = unit.bms.fault_count.max(1);
            unit.fault_reason = Some(String::from(description));
        }
    }

    /// Clears the fault shape after an operator reset.
    pub fn clear_fault(&mut self, unit_id: u8) {
        if let Some(unit) = self.unit_mut(unit_id) {
            unit.status = CommStatus::Normal;
            unit.bms.status = CommStatus::Normal;
            unit.pcs.status = CommStatus::Normal;
            unit.pcs.running_state = RunningState::Standby;
            unit.bms.fault_count = 0;
            unit.fault_reason = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    NotReady,
    Limited,
    Tracking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcsInput {
    pub pcs_id: u8,
    pub status: CommStatus,
    pub running_state: RunningState,
    pub fault_code: Option<String>,
    pub actual_kw: f64,
    pub adjustable_min_kw: f64,
    pub adjustable_max_kw: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmsInput {
    pub bms_id: u8,
    pub status: CommStatus,
    pub soc_pct: f64,
    pub temperature_c: f64,
    pub insulation_resistance_kohm: f64,
    pub delta_cell_voltage_mv: f64,
    pub warning_count: u32,
    pub fault_count: u32,
}

/// Setpoint fan-out to one PCS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PcsCommand {
    pub pcs_id: u8,
    pub enable: bool,
    pub setpoint_kw: f64,
    pub ramp_rate_kw_per_min: f64,
}

/// What one coordination unit knows about a peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeerSignal {
    pub peer_unit_id: u8,
    pub comm_status: CommStatus,
    pub latency_ms: u32,
    pub peer_ready: bool,
    pub peer_limit_power: bool,
    pub peer_exit_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationUnit {
    pub id: u8,
    pub status: CommStatus,
    pub ready: bool,
    pub execution: ExecutionStatus,
    pub adjustable_min_kw: f64,
    pub adjustable_max_kw: f64,
    pub pcs: Vec<PcsInput>,
    pub bms: Vec<BmsInput>,
    pub safety: SafetySignals,
    pub peer_signals: Vec<PeerSignal>,
    pub commands: Vec<PcsCommand>,
    pub lock_reason: Option<String>,
}

struct UnitComm {
    status: CommStatus,
    latency_ms: u32,
    ready: bool,
}

/// Partitions the plant's units round-robin into [`COORDINATION_UNIT_COUNT`]
/// coordination units and derives each unit's inputs, safety block, and
/// peer-link view from this tick's frame records.
pub fn build_coordination_units(
    units: &[BatteryUnit],
    commands: &ControlCommands,
    frames: &[FrameRecord],
) -> Vec<CoordinationUnit> {
    let enabled = commands.agc.enabled || commands.manual_power.enabled;
    let global_target = if commands.agc.enabled {
        commands.agc.target_power_kw
    } else if commands.manual_power.enabled {
        commands.manual_power.target_power_kw
    } else {
        0.0
    };
    let available = units.iter().filter(|u| !u.is_faulted()).count();
    let per_pcs = if available == 0 {
        0.0
    } else {
        global_target / available as f64
    };

    let mut built: Vec<CoordinationUnit> = Vec::with_capacity(COORDINATION_UNIT_COUNT as usize);
    let mut comms: Vec<UnitComm> = Vec::with_capacity(COORDINATION_UNIT_COUNT as usize);

    for cu in 1..=COORDINATION_UNIT_COUNT {
        let members: Vec<&BatteryUnit> = units
            .iter()
            .filter(|u| ((u.id - 1) % COORDINATION_UNIT_COUNT) + 1 == cu)
            .collect();

        let faulted: Vec<u8> = members
            .iter()
            .filter(|u| u.is_faulted())
            .map(|u| u.id)
            .collect();
        let any_warning = members.iter().any(|u| u.has_warning());

        let mut comm_status = CommStatus::Normal;
        let mut latency_ms = 0;
        for frame in frames {
            let touches_member = members.iter().any(|u| {
                frame.touches(DeviceKey::new(DeviceKind::Battery, u.id))
                    || frame.touches(DeviceKey::new(DeviceKind::Bms, u.id))
                    || frame.touches(DeviceKey::new(DeviceKind::Pcs, u.id))
            });
            if touches_member {
                comm_status = comm_status.merge(frame.status);
                latency_ms = latency_ms.max(frame.latency_ms);
            }
        }

        let safety = SafetySignals {
            fire_confirmed: false,
            emergency_stop: false,
            electrical_protection_trip: false,
            battery_trip: !faulted.is_empty(),
            battery_warning: any_warning,
            battery_pre_warning: any_warning,
            dc_bus_over_voltage: false,
            dc_bus_under_voltage: false,
            ac_breaker_closed: true,
            interlock_active: false,
        };

        let pcs: Vec<PcsInput> = members
            .iter()
            .map(|u| PcsInput {
                pcs_id: u.id,
                status: u.pcs.status,
                running_state: u.pcs.running_state,
                fault_code: u.fault_reason.clone(),
                actual_kw: u.pcs.actual_kw,
                adjustable_min_kw: -UNIT_MAX_KW,
                adjustable_max_kw: if u.is_faulted() { 0.0 } else { UNIT_MAX_KW },
            })
            .collect();
        let bms: Vec<BmsInput> = members
            .iter()
            .map(|u| BmsInput {
                bms_id: u.id,
                status: u.bms.status,
                soc_pct: u.bms.soc_pct,
                temperature_c: u.bms.temperature_c,
                insulation_resistance_kohm: u.bms.insulation_resistance_kohm,
                delta_cell_voltage_mv: u.bms.delta_cell_voltage_mv,
                warning_count: u.bms.warning_count,
                fault_count: u.bms.fault_count,
            })
            .collect();
        let cmds: Vec<PcsCommand> = members
            .iter()
            .map(|u| PcsCommand {
                pcs_id: u.id,
                enable: enabled && !u.is_faulted(),
                setpoint_kw: if u.is_faulted() { 0.0 } else { per_pcs },
                ramp_rate_kw_per_min: commands.agc.ramp_rate_kw_per_min,
            })
            .collect();

        let ready = enabled && safety.ac_breaker_closed && !safety.interlock_active;
        let target_sum: f64 = cmds.iter().map(|c| c.setpoint_kw).sum();
        let actual_sum: f64 = pcs.iter().map(|p| p.actual_kw).sum();
        let execution = if ready {
            if (target_sum - actual_sum).abs() > TRACKING_ERROR_LIMIT_KW {
                ExecutionStatus::Limited
            } else {
                ExecutionStatus::Tracking
            }
        } else {
            ExecutionStatus::NotReady
        };

        let status = members
            .iter()
            .map(|u| u.status)
            .fold(CommStatus::Normal, CommStatus::merge);
        let lock_reason = if faulted.is_empty() {
            None
        } else {
            let ids: Vec<String> = faulted.iter().map(|id| id.to_string()).collect();
            Some(format!("units faulted: {}", ids.join(",")))
        };

        comms.push(UnitComm {
            status: comm_status,
            latency_ms,
            ready,
        });
        built.push(CoordinationUnit {
            id: cu,
            status,
            ready,
            execution,
            adjustable_min_kw: pcs.iter().map(|p| p.adjustable_min_kw).sum(),
            adjustable_max_kw: pcs.iter().map(|p| p.adjustable_max_kw).sum(),
            pcs,
            bms,
            safety,
            peer_signals: Vec::new(),
            commands: cmds,
            lock_reason,
        });
    }

    // Second pass: each unit sees the others' link health.
    let peer_lists: Vec<Vec<PeerSignal>> = (0..built.len())
        .map(|idx| {
            comms
                .iter()
                .enumerate()
                .filter(|(peer_idx, _)| *peer_idx != idx)
                .map(|(peer_idx, peer)| PeerSignal {
                    peer_unit_id: built[peer_idx].id,
                    comm_status: peer.status,
                    latency_ms: peer.latency_ms,
                    peer_ready: peer.ready,
                    peer_limit_power: built[peer_idx].execution == ExecutionStatus::Limited,
                    peer_exit_run: built[peer_idx].execution == ExecutionStatus::NotReady,
                })
                .collect()
        })
        .collect();
    for (unit, peers) in built.iter_mut().zip(peer_lists) {
        unit.peer_signals = peers;
    }

    built
}
