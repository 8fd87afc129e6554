//! Station agent: the tick orchestrator behind the public API.
//!
//! One [`StationAgent::tick`] runs the whole loop: autonomous takeover of the
//! command plane, plant power ramp, the topology exchange schedule, the latch
//! scan, snapshot persistence, and the EMS dispatch decision. The agent owns
//! every store; callers only feed it timestamps and commands.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::autopower::{
    compute_auto_power_decision, ramp_toward, should_auto_avc, should_use_auto, AutoPowerConfig,
    AutoPowerDecision, MarketDataProvider, NullMarketDataProvider, MAX_POWER_STEP_KW,
    MAX_VOLTAGE_STEP_V, REMOTE_HOLD_TTL_MS,
};
use crate::bus::FrameRecord;
use crate::command::{Actor, AuditEntry, CommandRequest, CommandStore, ControlCommands};
use crate::latch::{AlarmOccurrence, LatchDecision, LatchStore, OperatorNotification, ResetOutcome};
use crate::plant::{build_coordination_units, PlantState};
use crate::protection::{
    compute_ems_decision, DecisionInputs, EmsDecision, ProtectionDeviceName, TripLatchStore,
};
use crate::store::{
    CoordinationSnapshot, MemoryStore, SnapshotStore, SystemTelemetry, UnitSnapshot,
    DEFAULT_RETENTION_MS,
};
use crate::topology::{SourceUnit, TopologyConfig, TopologySimulator};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy)]
pub struct StationConfig {
    pub unit_count: u8,
    pub ccu_count: u8,
    pub tick_interval_ms: u64,
    pub drop_rate: f64,
    pub corrupt_rate: f64,
    pub seed: u64,
    pub retention_ms: u64,
    pub auto_enabled: bool,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            unit_count: 10,
            ccu_count: 3,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            drop_rate: 0.0,
            corrupt_rate: 0.0,
            seed: crate::bus::DEFAULT_RNG_SEED,
            retention_ms: DEFAULT_RETENTION_MS,
            auto_enabled: true,
        }
    }
}

/// Everything one tick produced.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub ts: u64,
    pub frames: Vec<FrameRecord>,
    pub latched_units: Vec<u8>,
    pub new_occurrences: Vec<AlarmOccurrence>,
    pub commands: ControlCommands,
    pub auto: Option<AutoPowerDecision>,
    pub ems: EmsDecision,
}

pub struct StationAgent<M: MarketDataProvider = NullMarketDataProvider> {
    cfg: StationConfig,
    auto_cfg: AutoPowerConfig,
    topology: TopologySimulator,
    plant: PlantState,
    latches: LatchStore,
    trips: TripLatchStore,
    commands: CommandStore,
    store: MemoryStore,
    market: M,
    last_tick_ts: Option<u64>,
}

impl StationAgent {
    pub fn new() -> Self {
        Self::with_config(StationConfig::default())
    }

    pub fn with_config(cfg: StationConfig) -> Self {
        Self::with_market(cfg, AutoPowerConfig::default(), NullMarketDataProvider)
    }
}

impl Default for StationAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MarketDataProvider> StationAgent<M> {
    pub fn with_market(cfg: StationConfig, auto_cfg: AutoPowerConfig, market: M) -> Self {
        let topology = TopologySimulator::new(TopologyConfig {
            unit_count: cfg.unit_count,
            ccu_count: cfg.ccu_count,
            drop_rate: cfg.drop_rate,
            corrupt_rate: cfg.corrupt_rate,
            seed: cfg.seed,
        });
        Self {
            cfg,
            auto_cfg,
            topology,
            plant: PlantState::new(cfg.unit_count),
            latches: LatchStore::new(),
            trips: TripLatchStore::new(),
            commands: CommandStore::new(),
            store: MemoryStore::new(),
            market,
            last_tick_ts: None,
        }
    }

    pub fn config(&self) -> &StationConfig {
        &self.cfg
    }

    pub fn plant(&self) -> &PlantState {
        &self.plant
    }

    pub fn plant_mut(&mut self) -> &mut PlantState {
        &mut self.plant
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn occurrences(&self) -> &[AlarmOccurrence] {
        self.latches.occurrences()
    }

    pub fn notifications(&self) -> &[OperatorNotification] {
        self.latches.notifications()
    }

    pub fn audit(&self) -> &[AuditEntry] {
        self.commands.audit()
    }

    pub fn effective_commands(&self) -> ControlCommands {
        self.commands.effective()
    }

    pub fn set_impairment(&mut self, drop_rate: f64, corrupt_rate: f64) {
        self.topology.set_impairment(drop_rate, corrupt_rate);
    }

    /// Operator/remote write to the command plane.
    pub fn apply_commands(
        &mut self,
        request: CommandRequest,
        actor: Actor,
        ts: u64,
    ) -> ControlCommands {
        self.commands.set(request, actor, ts)
    }

    /// Clears a unit's latch and, when the latch store accepts the reset,
    /// its fault shape in the plant.
    pub fn reset_unit(&mut self, unit_id: u8, ts: u64, actor: &str) -> ResetOutcome {
        let outcome = self.latches.reset(unit_id, ts, actor);
        if outcome.ok {
            self.plant.clear_fault(unit_id);
        }
        outcome
    }

    /// Clears a protection device's trip latch. Returns whether it was
    /// tripped.
    pub fn reset_protection_device(&mut self, name: ProtectionDeviceName) -> bool {
        self.trips.reset(name)
    }

    /// What the autonomous engine would decide right now, without writing
    /// anything.
    pub fn auto_power_preview(&self, ts: u64) -> AutoPowerDecision {
        compute_auto_power_decision(&self.store, &self.market, &self.auto_cfg, ts)
    }

    /// Runs one full simulation step.
    pub fn tick(&mut self, ts: u64) -> TickReport {
        let dt_ms = self
            .last_tick_ts
            .map_or(self.cfg.tick_interval_ms, |last| ts.saturating_sub(last));
        self.last_tick_ts = Some(ts);

        // 1) autonomous takeover of the command plane
        let auto = if self.cfg.auto_enabled
            && should_use_auto(self.commands.current(), ts, REMOTE_HOLD_TTL_MS)
        {
            let decision =
                compute_auto_power_decision(&self.store, &self.market, &self.auto_cfg, ts);
            let allow_avc = should_auto_avc(self.commands.current(), ts, REMOTE_HOLD_TTL_MS);
            // Ramp relative to the previously issued command, so taking over
            // from an external hold cannot step the station target. When the
            // previous command had the channel disabled there is nothing to
            // ramp from and the computed target applies directly.
            let prev = self.commands.effective();
            let mut proposed = decision.commands;
            if proposed.agc.enabled && prev.agc.enabled {
                proposed.agc.target_power_kw = ramp_toward(
                    prev.agc.target_power_kw,
                    proposed.agc.target_power_kw,
                    MAX_POWER_STEP_KW,
                );
            }
            if proposed.avc.enabled && allow_avc {
                if prev.avc.enabled {
                    proposed.avc.target_voltage_v = ramp_toward(
                        prev.avc.target_voltage_v,
                        proposed.avc.target_voltage_v,
                        MAX_VOLTAGE_STEP_V,
                    );
                }
            } else if !allow_avc {
                proposed.avc = prev.avc;
            }
            self.commands.write_auto(proposed, ts);
            Some(decision)
        } else {
            None
        };

        let effective = self.commands.effective();
        let drive_target_kw = if effective.manual_power.enabled {
            effective.manual_power.target_power_kw
        } else if effective.agc.enabled {
            effective.agc.target_power_kw
        } else {
            0.0
        };

        // 2) plant ramp and field traffic
        self.plant.step(drive_target_kw, dt_ms, ts);
        let mut sources = BTreeMap::new();
        for unit in self.plant.units() {
            sources.insert(
                unit.id,
                SourceUnit {
                    telemetry: unit.telemetry(),
                    unit_status: unit.status,
                    bms_status: unit.bms.status,
                },
            );
        }
        self.topology.set_sources(sources);
        let frames = self.topology.tick(ts);

        // 3) latch scan over worst-cell readings
        let occurrence_mark = self.latches.occurrences().len();
        let readings: Vec<_> = self
            .plant
            .units()
            .iter()
            .map(|u| (u.id, u.readings()))
            .collect();
        for (unit_id, reading) in readings {
            if let LatchDecision::Latched { description, .. } =
                self.latches.evaluate(unit_id, &reading, ts)
            {
                self.plant.apply_latch(unit_id, &description);
            }
        }
        let latched_units = self.latches.latched_units();

        // 4) snapshots and the dispatch decision
        let coordination = build_coordination_units(self.plant.units(), &effective, &frames);
        let telemetry = self.telemetry_row(ts, &coordination);
        let meta = self.commands.current().map(|c| c.meta);
        let ems = compute_ems_decision(
            &DecisionInputs {
                units: self.plant.units(),
                coordination: &coordination,
                commands: &effective,
                meta: meta.as_ref(),
                now: ts,
            },
            &mut self.trips,
        );

        self.store.push_units(UnitSnapshot {
            ts,
            units: self.plant.units().to_vec(),
        });
        self.store.push_coordination(CoordinationSnapshot {
            ts,
            units: coordination,
        });
        self.store.push_telemetry(telemetry);
        self.store.push_frames(&frames);
        self.store
            .trim_before(ts.saturating_sub(self.cfg.retention_ms));

        let new_occurrences = self.latches.occurrences()[occurrence_mark..].to_vec();
        TickReport {
            ts,
            frames,
            latched_units,
            new_occurrences,
            commands: effective,
            auto,
            ems,
        }
    }

    fn telemetry_row(
        &self,
        ts: u64,
        coordination: &[crate::plant::CoordinationUnit],
    ) -> SystemTelemetry {
        let units = self.plant.units();
        let count = units.len().max(1) as f64;
        let total_power_kw = round1(self.plant.total_actual_kw());
        let limit_kw: f64 = coordination
            .iter()
            .map(|u| u.adjustable_max_kw.max(0.0))
            .sum();
        let system_load_pct = if limit_kw > 0.0 {
            round1(total_power_kw.abs() / limit_kw * 100.0)
        } else {
            0.0
        };
        SystemTelemetry {
            ts,
            system_soc_pct: round1(self.plant.average_soc_pct()),
            system_soh_pct: round1(
                units.iter().map(|u| u.bms.soh).sum::<f64>() / count * 100.0,
            ),
            average_voltage_v: round1(units.iter().map(|u| u.voltage_v).sum::<f64>() / count),
            average_temperature_c: round1(
                units.iter().map(|u| u.bms.temperature_c).sum::<f64>() / count,
            ),
            total_power_kw,
            system_load_pct,
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
