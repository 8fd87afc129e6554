//! Protection devices and the per-tick EMS dispatch decision.
//!
//! Five named protection devices watch the OR-reduced safety signals from
//! the coordination layer. A trip latches in an explicit [`TripLatchStore`]
//! and holds the device in error until a reset names it. The decision
//! function turns unit state, coordination snapshots, and the current
//! command block into readiness, mode, and clamped station targets.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::command::{Actor, CommandMeta, ControlCommands};
use crate::plant::{BatteryUnit, CoordinationUnit};
use crate::protocol::CommStatus;

pub const PROTECTION_DEVICE_COUNT: usize = 5;

/// Worst insulation below this, combined with a hard trigger, trips the IMD.
pub const IMD_TRIP_KOHM: f64 = 120.0;
/// Worst insulation below this warns the IMD.
pub const IMD_WARN_KOHM: f64 = 200.0;

const COMM_SHRINK: f64 = 0.75;
const FIELD_SHRINK: f64 = 0.85;
const SOC_LOW_LIMIT_PCT: f64 = 15.0;
const SOC_HIGH_LIMIT_PCT: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionDeviceName {
    AcSideProtection,
    DcSideProtection,
    FireInterlock,
    BatteryEarlyWarning,
    InsulationMonitor,
}

impl ProtectionDeviceName {
    pub const ALL: [Self; PROTECTION_DEVICE_COUNT] = [
        Self::AcSideProtection,
        Self::DcSideProtection,
        Self::FireInterlock,
        Self::BatteryEarlyWarning,
        Self::InsulationMonitor,
    ];
}

impl core::fmt::Display for ProtectionDeviceName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AcSideProtection => write!(f, "AC-side electrical protection"),
            Self::DcSideProtection => write!(f, "DC-side electrical protection"),
            Self::FireInterlock => write!(f, "fire interlock module"),
            Self::BatteryEarlyWarning => write!(f, "battery early-warning system (BEW)"),
            Self::InsulationMonitor => write!(f, "insulation monitoring device (IMD)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripLatch {
    pub reason: String,
    pub at: u64,
}

/// Sticky trip state for the protection devices. A latched device stays
/// tripped until [`TripLatchStore::reset`] names it.
#[derive(Debug, Default)]
pub struct TripLatchStore {
    latched: BTreeMap<ProtectionDeviceName, TripLatch>,
}

impl TripLatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tripped(&self, name: ProtectionDeviceName) -> bool {
        self.latched.contains_key(&name)
    }

    pub fn any_tripped(&self) -> bool {
        !self.latched.is_empty()
    }

    pub fn latch(&mut self, name: ProtectionDeviceName, reason: String, at: u64) {
        // First trip wins; later triggers do not rewrite the cause.
        self.latched.entry(name).or_insert(TripLatch { reason, at });
    }

    /// Returns whether the device had been latched.
    pub fn reset(&mut self, name: ProtectionDeviceName) -> bool {
        self.latched.remove(&name).is_some()
    }

    pub fn latch_reason(&self, name: ProtectionDeviceName) -> Option<&str> {
        self.latched.get(&name).map(|l| l.reason.as_str())
    }
}

/// Hard-wired safety signals, OR-reduced across the coordination units
/// (the breaker state is AND-reduced: one open breaker opens the station).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SafetySignals {
    pub fire_confirmed: bool,
    pub emergency_stop: bool,
    pub electrical_protection_trip: bool,
    pub battery_trip: bool,
    pub battery_warning: bool,
    pub battery_pre_warning: bool,
    pub dc_bus_over_voltage: bool,
    pub dc_bus_under_voltage: bool,
    pub ac_breaker_closed: bool,
    pub interlock_active: bool,
}

impl SafetySignals {
    pub fn or_reduce(units: &[CoordinationUnit]) -> Self {
        Self {
            fire_confirmed: units.iter().any(|u| u.safety.fire_confirmed),
            emergency_stop: units.iter().any(|u| u.safety.emergency_stop),
            electrical_protection_trip: units
                .iter()
                .any(|u| u.safety.electrical_protection_trip),
            battery_trip: units.iter().any(|u| u.safety.battery_trip),
            battery_warning: units.iter().any(|u| u.safety.battery_warning),
            battery_pre_warning: units.iter().any(|u| u.safety.battery_pre_warning),
            dc_bus_over_voltage: units.iter().any(|u| u.safety.dc_bus_over_voltage),
            dc_bus_under_voltage: units.iter().any(|u| u.safety.dc_bus_under_voltage),
            ac_breaker_closed: units.iter().all(|u| u.safety.ac_breaker_closed),
            interlock_active: units.iter().any(|u| u.safety.interlock_active),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionAction {
    None,
    Warn,
    Trip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionDevice {
    pub name: ProtectionDeviceName,
    pub status: CommStatus,
    pub trip: bool,
    pub last_action: ProtectionAction,
    pub reason: Option<String>,
}

/// Evaluates the five devices against the given signals, latching new trips
/// into `trips`.
pub fn build_protection_devices(
    trips: &mut TripLatchStore,
    signals: &SafetySignals,
    worst_insulation: Option<(u8, f64)>,
    now: u64,
) -> Vec<ProtectionDevice> {
    let (worst_unit, worst_kohm) = worst_insulation.unwrap_or((0, 999.0));
    let hard_trigger = signals.electrical_protection_trip
        || signals.emergency_stop
        || signals.fire_confirmed
        || signals.battery_trip;

    let mut out = Vec::with_capacity(PROTECTION_DEVICE_COUNT);

    out.push(evaluate_device(
        trips,
        ProtectionDeviceName::AcSideProtection,
        (signals.emergency_stop || signals.electrical_protection_trip).then(|| {
            format!(
                "safety signal trigger (emergency_stop={}, electrical_protection_trip={})",
                u8::from(signals.emergency_stop),
                u8::from(signals.electrical_protection_trip)
            )
        }),
        (!signals.ac_breaker_closed)
            .then(|| String::from("AC breaker open, protection in supervisory lockout")),
        now,
    ));

    out.push(evaluate_device(
        trips,
        ProtectionDeviceName::DcSideProtection,
        signals
            .electrical_protection_trip
            .then(|| String::from("electrical protection action signal, DC-side trip")),
        if signals.dc_bus_over_voltage {
            Some(String::from("DC bus over-voltage signal"))
        } else if signals.dc_bus_under_voltage {
            Some(String::from("DC bus under-voltage signal"))
        } else {
            None
        },
        now,
    ));

    out.push(evaluate_device(
        trips,
        ProtectionDeviceName::FireInterlock,
        signals
            .fire_confirmed
            .then(|| String::from("fire confirmed signal, interlock and exit run")),
        None,
        now,
    ));

    // Unit faults isolate and derate; they must never stop the whole
    // station, so the BEW only ever warns.
    out.push(evaluate_device(
        trips,
        ProtectionDeviceName::BatteryEarlyWarning,
        None,
        if signals.battery_trip {
            Some(String::from(
                "battery unit fault isolated, its available power forced to 0 and output redistributed",
            ))
        } else if signals.battery_warning {
            Some(String::from("battery warning signal, check unit state"))
        } else if signals.battery_pre_warning {
            Some(String::from(
                "battery pre-warning signal, watch temperature and consistency trends",
            ))
        } else {
            None
        },
        now,
    ));

    out.push(evaluate_device(
        trips,
        ProtectionDeviceName::InsulationMonitor,
        (worst_kohm < IMD_TRIP_KOHM && hard_trigger).then(|| {
            format!(
                "insulation critically low with hard trigger (unit-{worst_unit} {worst_kohm} kOhm < {IMD_TRIP_KOHM} kOhm)"
            )
        }),
        (worst_kohm < IMD_WARN_KOHM).then(|| {
            format!("insulation low (worst: unit-{worst_unit} {worst_kohm} kOhm < {IMD_WARN_KOHM} kOhm)")
        }),
        now,
    ));

    out
}

fn evaluate_device(
    trips: &mut TripLatchStore,
    name: ProtectionDeviceName,
    trip_reason: Option<String>,
    warn_reason: Option<String>,
    now: u64,
) -> ProtectionDevice {
    if let Some(reason) = trips.latch_reason(name) {
        return ProtectionDevice {
            name,
            status: CommStatus::Error,
            trip: true,
            last_action: ProtectionAction::Trip,
            reason: Some(format!("trip latched: {reason} (reset required)")),
        };
    }
    if let Some(reason) = trip_reason {
        trips.latch(name, reason.clone(), now);
        return ProtectionDevice {
            name,
            status: CommStatus::Error,
            trip: true,
            last_action: ProtectionAction::Trip,
            reason: Some(format!("tripped: {reason} (latched, reset required)")),
        };
    }
    if let Some(reason) = warn_reason {
        return ProtectionDevice {
            name,
            status: CommStatus::Warning,
            trip: false,
            last_action: ProtectionAction::Warn,
            reason: Some(reason),
        };
    }
    ProtectionDevice {
        name,
        status: CommStatus::Normal,
        trip: false,
        last_action: ProtectionAction::None,
        reason: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionMode {
    #[serde(rename = "AGC")]
    Agc,
    #[serde(rename = "LIMITED")]
    Limited,
    #[serde(rename = "SAFE_STOP")]
    SafeStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoltageSource {
    Local,
    Remote,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    Interlock,
    CommDegraded,
    FieldFault,
    SocBound,
    AgcDisabled,
}

impl core::fmt::Display for LimitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Interlock => write!(f, "safety interlock"),
            Self::CommDegraded => write!(f, "communication degraded"),
            Self::FieldFault => write!(f, "field device fault derate"),
            Self::SocBound => write!(f, "SOC boundary protection"),
            Self::AgcDisabled => write!(f, "AGC not enabled"),
        }
    }
}

/// One tick's dispatch decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmsDecision {
    pub ts: u64,
    pub ready: bool,
    pub mode: DecisionMode,
    pub station_target_power_kw: f64,
    pub station_target_voltage_v: Option<f64>,
    pub voltage_source: Option<VoltageSource>,
    pub limit_reason: Option<LimitReason>,
    pub available_power_limit_kw: f64,
    pub avg_soc_pct: f64,
    pub actual_total_kw: f64,
    pub interlock_active: bool,
    pub protection: Vec<ProtectionDevice>,
    pub rationale: Vec<String>,
    pub actions: Vec<String>,
}

pub struct DecisionInputs<'a> {
    pub units: &'a [BatteryUnit],
    pub coordination: &'a [CoordinationUnit],
    pub commands: &'a ControlCommands,
    pub meta: Option<&'a CommandMeta>,
    pub now: u64,
}

/// Readiness, mode, and clamped station targets for one tick. New protection
/// trips latch in `trips` as a side effect.
pub fn compute_ems_decision(inputs: &DecisionInputs<'_>, trips: &mut TripLatchStore) -> EmsDecision {
    let commands = inputs.commands;
    let agc_enabled = commands.agc.enabled;
    let avc_enabled = commands.avc.enabled;

    let signals = SafetySignals::or_reduce(inputs.coordination);
    let worst_insulation = inputs
        .units
        .iter()
        .map(|u| (u.id, u.bms.insulation_resistance_kohm))
        .min_by(|a, b| a.1.total_cmp(&b.1));
    let protection = build_protection_devices(trips, &signals, worst_insulation, inputs.now);

    let interlock_active = signals.interlock_active;
    let protection_trip = protection.iter().any(|p| p.trip);
    let comm_bad = inputs
        .coordination
        .iter()
        .flat_map(|u| u.peer_signals.iter())
        .any(|p| p.comm_status == CommStatus::Error);
    let field_error = inputs
        .units
        .iter()
        .any(|u| u.pcs.status.is_error() || u.bms.status.is_error());

    let avg_soc_pct = if inputs.units.is_empty() {
        0.0
    } else {
        (inputs.units.iter().map(|u| u.bms.soc_pct).sum::<f64>() / inputs.units.len() as f64)
            .round()
    };
    let available_power_limit_kw: f64 = inputs
        .coordination
        .iter()
        .flat_map(|u| u.pcs.iter())
        .map(|p| p.adjustable_max_kw.max(0.0))
        .sum::<f64>()
        .round();
    let actual_total_kw =
        round1(inputs.units.iter().map(|u| u.pcs.actual_kw).sum::<f64>());

    let mut rationale = Vec::new();
    let mut actions = Vec::new();

    let ready = !(interlock_active || protection_trip);
    if !ready {
        rationale.push(String::from(
            "safety interlock or protection trip detected, entering safe stop strategy",
        ));
    }
    if comm_bad {
        rationale.push(String::from(
            "coordination links report faults, entering limited power strategy",
        ));
    }
    if field_error {
        rationale.push(String::from(
            "field devices report faults, control target will be derated",
        ));
    }

    if !ready {
        rationale.push(String::from("station target forced to 0 kW by safe stop"));
        actions.push(String::from("issue station stop target: P=0kW"));
        actions.push(String::from("freeze AGC/AVC execution until the interlock clears"));
        return EmsDecision {
            ts: inputs.now,
            ready,
            mode: DecisionMode::SafeStop,
            station_target_power_kw: 0.0,
            station_target_voltage_v: None,
            voltage_source: None,
            limit_reason: Some(LimitReason::Interlock),
            available_power_limit_kw,
            avg_soc_pct,
            actual_total_kw,
            interlock_active,
            protection,
            rationale,
            actions,
        };
    }

    let requested_kw = if agc_enabled {
        commands.agc.target_power_kw
    } else {
        0.0
    };
    let limit = available_power_limit_kw.max(0.0);
    let bounded_kw = if limit > 0.0 {
        requested_kw.clamp(-limit, limit)
    } else {
        requested_kw
    };
    rationale.push(format!(
        "station target: P_req={requested_kw}kW P_lim={limit}kW P_clamp={}kW",
        round1(bounded_kw)
    ));

    let mut target_kw = round1(bounded_kw);
    let mut mode = if agc_enabled {
        DecisionMode::Agc
    } else {
        DecisionMode::Limited
    };
    let mut limit_reason = None;
    if !agc_enabled {
        limit_reason = Some(LimitReason::AgcDisabled);
        rationale.push(String::from(
            "AGC not enabled, emitting hold/limited power target this cycle",
        ));
        actions.push(String::from("AGC disabled: output is a limited/hold strategy"));
    }

    let actor = inputs.meta.map(|m| m.actor);
    let avc_provided = inputs.meta.map(|m| m.avc_provided);
    let voltage_source = if actor == Some(Actor::Local) {
        Some(VoltageSource::Local)
    } else if actor == Some(Actor::Remote) && avc_provided == Some(true) {
        Some(VoltageSource::Remote)
    } else if avc_enabled {
        Some(VoltageSource::Auto)
    } else {
        None
    };
    let station_target_voltage_v = if avc_enabled {
        actions.push(format!(
            "AVC enabled: bus voltage target={}V",
            commands.avc.target_voltage_v
        ));
        Some(commands.avc.target_voltage_v)
    } else {
        None
    };

    if comm_bad || field_error || avg_soc_pct < SOC_LOW_LIMIT_PCT || avg_soc_pct > SOC_HIGH_LIMIT_PCT
    {
        mode = DecisionMode::Limited;
        let shrink = if comm_bad { COMM_SHRINK } else { FIELD_SHRINK };
        let before = target_kw;
        target_kw = round1(target_kw * shrink);
        limit_reason = Some(if comm_bad {
            LimitReason::CommDegraded
        } else if field_error {
            LimitReason::FieldFault
        } else {
            LimitReason::SocBound
        });
        rationale.push(format!(
            "derate triggered ({}): P={before}x{shrink}={target_kw}kW",
            limit_reason.map_or("", |r| match r {
                LimitReason::CommDegraded => "comm",
                LimitReason::FieldFault => "field",
                _ => "soc",
            })
        ));
        actions.push(format!("shrink factor={shrink}, target adjusted to {target_kw}kW"));
    } else {
        rationale.push(String::from("ready conditions met, tracking AGC/AVC targets"));
        actions.push(format!("issue station control target: P={target_kw}kW"));
    }

    EmsDecision {
        ts: inputs.now,
        ready,
        mode,
        station_target_power_kw: target_kw,
        station_target_voltage_v,
        voltage_source,
        limit_reason,
        available_power_limit_kw,
        avg_soc_pct,
        actual_total_kw,
        interlock_active,
        protection,
        rationale,
        actions,
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::{build_coordination_units, PlantState};

    fn agc_commands(target: f64) -> ControlCommands {
        let mut commands = ControlCommands::default();
        commands.agc.enabled = true;
        commands.agc.target_power_kw = target;
        commands
    }

    fn decide(
        plant: &PlantState,
        commands: &ControlCommands,
        trips: &mut TripLatchStore,
    ) -> EmsDecision {
        let coordination = build_coordination_units(plant.units(), commands, &[]);
        compute_ems_decision(
            &DecisionInputs {
                units: plant.units(),
                coordination: &coordination,
                commands,
                meta: None,
                now: 1_000,
            },
            trips,
        )
    }

    #[test]
    fn test_all_normal_agc_tracks_requested_power() {
        let plant = PlantState::new(10);
        let commands = agc_commands(300.0);
        let mut trips = TripLatchStore::new();
        let decision = decide(&plant, &commands, &mut trips);
        assert!(decision.ready);
        assert_eq!(decision.mode, DecisionMode::Agc);
        assert!((decision.station_target_power_kw - 300.0).abs() < 1e-9);
        assert!((decision.available_power_limit_kw - 1800.0).abs() < 1e-9);
        assert!(decision.limit_reason.is_none());
        assert!(!trips.any_tripped());
    }

    #[test]
    fn test_target_clamped_to_available_limit() {
        let plant = PlantState::new(2);
        let commands = agc_commands(5_000.0);
        let mut trips = TripLatchStore::new();
        let decision = decide(&plant, &commands, &mut trips);
        assert!((decision.station_target_power_kw - 360.0).abs() < 1e-9);
    }

    #[test]
    fn test_agc_disabled_yields_limited_zero_target() {
        let plant = PlantState::new(4);
        let commands = ControlCommands::default();
        let mut trips = TripLatchStore::new();
        let decision = decide(&plant, &commands, &mut trips);
        assert_eq!(decision.mode, DecisionMode::Limited);
        assert_eq!(decision.limit_reason, Some(LimitReason::AgcDisabled));
        assert!(decision.station_target_power_kw.abs() < 1e-9);
    }

    #[test]
    fn test_field_fault_derates_target() {
        let mut plant = PlantState::new(10);
        plant.apply_latch(4, "cell temp high");
        let commands = agc_commands(300.0);
        let mut trips = TripLatchStore::new();
        let decision = decide(&plant, &commands, &mut trips);
        assert_eq!(decision.mode, DecisionMode::Limited);
        assert_eq!(decision.limit_reason, Some(LimitReason::FieldFault));
        assert!((decision.station_target_power_kw - 255.0).abs() < 1e-9);
        // One faulted unit only warns the BEW; the station stays ready.
        assert!(decision.ready);
        assert!(!trips.any_tripped());
    }

    #[test]
    fn test_interlock_forces_safe_stop() {
        let plant = PlantState::new(6);
        let commands = agc_commands(300.0);
        let mut coordination = build_coordination_units(plant.units(), &commands, &[]);
        coordination[0].safety.interlock_active = true;
        let mut trips = TripLatchStore::new();
        let decision = compute_ems_decision(
            &DecisionInputs {
                units: plant.units(),
                coordination: &coordination,
                commands: &commands,
                meta: None,
                now: 1_000,
            },
            &mut trips,
        );
        assert!(!decision.ready);
        assert_eq!(decision.mode, DecisionMode::SafeStop);
        assert!(decision.station_target_power_kw.abs() < 1e-9);
        assert!(decision.station_target_voltage_v.is_none());
    }

    #[test]
    fn test_protection_trip_latches_until_named_reset() {
        let plant = PlantState::new(3);
        let commands = agc_commands(100.0);
        let mut coordination = build_coordination_units(plant.units(), &commands, &[]);
        coordination[0].safety.emergency_stop = true;
        let mut trips = TripLatchStore::new();
        let inputs = DecisionInputs {
            units: plant.units(),
            coordination: &coordination,
            commands: &commands,
            meta: None,
            now: 1_000,
        };
        let decision = compute_ems_decision(&inputs, &mut trips);
        assert_eq!(decision.mode, DecisionMode::SafeStop);
        assert!(trips.is_tripped(ProtectionDeviceName::AcSideProtection));

        // Signal clears but the latch holds the trip.
        coordination[0].safety.emergency_stop = false;
        let inputs = DecisionInputs {
            units: plant.units(),
            coordination: &coordination,
            commands: &commands,
            meta: None,
            now: 3_000,
        };
        let decision = compute_ems_decision(&inputs, &mut trips);
        assert_eq!(decision.mode, DecisionMode::SafeStop);

        assert!(trips.reset(ProtectionDeviceName::AcSideProtection));
        let decision = compute_ems_decision(
            &DecisionInputs {
                units: plant.units(),
                coordination: &coordination,
                commands: &commands,
                meta: None,
                now: 5_000,
            },
            &mut trips,
        );
        assert_eq!(decision.mode, DecisionMode::Agc);
    }

    #[test]
    fn test_bew_warns_but_never_trips_on_battery_fault() {
        let mut signals = SafetySignals {
            ac_breaker_closed: true,
            ..SafetySignals::default()
        };
        signals.battery_trip = true;
        let mut trips = TripLatchStore::new();
        let devices = build_protection_devices(&mut trips, &signals, Some((1, 500.0)), 1_000);
        let bew = devices
            .iter()
            .find(|d| d.name == ProtectionDeviceName::BatteryEarlyWarning)
            .unwrap();
        assert_eq!(bew.status, CommStatus::Warning);
        assert!(!bew.trip);
        assert!(!trips.is_tripped(ProtectionDeviceName::BatteryEarlyWarning));
    }

    #[test]
    fn test_imd_trips_only_with_hard_trigger() {
        let base = SafetySignals {
            ac_breaker_closed: true,
            ..SafetySignals::default()
        };

        // Very low insulation alone only warns.
        let mut trips = TripLatchStore::new();
        let devices = build_protection_devices(&mut trips, &base, Some((2, 100.0)), 1_000);
        let imd = devices
            .iter()
            .find(|d| d.name == ProtectionDeviceName::InsulationMonitor)
            .unwrap();
        assert_eq!(imd.status, CommStatus::Warning);
        assert!(!imd.trip);

        // With a hard trigger it trips and latches.
        let mut trips = TripLatchStore::new();
        let mut hard = base;
        hard.battery_trip = true;
        let devices = build_protection_devices(&mut trips, &hard, Some((2, 100.0)), 1_000);
        let imd = devices
            .iter()
            .find(|d| d.name == ProtectionDeviceName::InsulationMonitor)
            .unwrap();
        assert!(imd.trip);
        assert!(trips.is_tripped(ProtectionDeviceName::InsulationMonitor));
    }

    #[test]
    fn test_voltage_source_resolution() {
        let plant = PlantState::new(3);
        let mut commands = agc_commands(50.0);
        commands.avc.enabled = true;
        commands.avc.target_voltage_v = 402.0;
        let coordination = build_coordination_units(plant.units(), &commands, &[]);
        let mut trips = TripLatchStore::new();

        let meta = CommandMeta {
            actor: Actor::Remote,
            agc_provided: true,
            avc_provided: true,
            manual_power_provided: false,
        };
        let decision = compute_ems_decision(
            &DecisionInputs {
                units: plant.units(),
                coordination: &coordination,
                commands: &commands,
                meta: Some(&meta),
                now: 1_000,
            },
            &mut trips,
        );
        assert_eq!(decision.voltage_source, Some(VoltageSource::Remote));
        assert_eq!(decision.station_target_voltage_v, Some(402.0));

        let meta = CommandMeta {
            actor: Actor::Remote,
            agc_provided: true,
            avc_provided: false,
            manual_power_provided: false,
        };
        let decision = compute_ems_decision(
            &DecisionInputs {
                units: plant.units(),
                coordination: &coordination,
                commands: &commands,
                meta: Some(&meta),
                now: 1_000,
            },
            &mut trips,
        );
        assert_eq!(decision.voltage_source, Some(VoltageSource::Auto));
    }
}
