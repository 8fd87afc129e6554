//! Autonomous power/voltage engine.
//!
//! When no operator holds the command plane, this engine reads the tick
//! history out of the snapshot store, scores plant health with smoothstep
//! ramps over worst-cell readings and their trends, and proposes an AGC/AVC
//! command block. A hard stop is reserved for an active interlock or an
//! all-units fault; everything else only derates.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::command::{Actor, AvcCommand, ControlCommands, StoredCommand, VoltageRange};
use crate::store::SnapshotStore;

/// How long a remote hold on the command plane stays fresh.
pub const REMOTE_HOLD_TTL_MS: u64 = 300_000;

/// Largest station power move the engine makes in one tick.
pub const MAX_POWER_STEP_KW: f64 = 120.0;
/// Largest voltage-target move the engine makes in one tick.
pub const MAX_VOLTAGE_STEP_V: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPowerConfig {
    pub history_window_ms: u64,
    pub max_history_points: usize,
    /// Floor of the combined health factor; trends derate, never stop.
    pub min_health_factor: f64,
    pub unit_capacity_kwh: f64,
    pub soc_min_pct: f64,
    pub soc_max_pct: f64,
    pub energy_horizon_hours: f64,
    pub fallback_limit_kw: f64,
    pub price_mid_cny_per_mwh: f64,
    pub price_span_cny_per_mwh: f64,
    pub price_scale: f64,
    pub voltage_nominal_v: f64,
    pub voltage_min_v: f64,
    pub voltage_max_v: f64,
    pub voltage_kp: f64,
    pub voltage_max_err_v: f64,
    pub voltage_load_comp_v: f64,
    pub voltage_soc_comp_v: f64,
    pub avc_enabled: bool,
}

impl Default for AutoPowerConfig {
    fn default() -> Self {
        Self {
            history_window_ms: 3_600_000,
            max_history_points: 720,
            min_health_factor: 0.2,
            unit_capacity_kwh: 200.0,
            soc_min_pct: 20.0,
            soc_max_pct: 90.0,
            energy_horizon_hours: 0.25,
            fallback_limit_kw: 1_800.0,
            price_mid_cny_per_mwh: 500.0,
            price_span_cny_per_mwh: 300.0,
            price_scale: 0.25,
            voltage_nominal_v: 400.0,
            voltage_min_v: 380.0,
            voltage_max_v: 420.0,
            voltage_kp: 0.35,
            voltage_max_err_v: 15.0,
            voltage_load_comp_v: 3.0,
            voltage_soc_comp_v: 2.0,
            avc_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPriceSignal {
    pub price_cny_per_mwh: f64,
    pub source: String,
    pub ts: u64,
}

/// Optional market feed. The engine treats a missing signal as a zero term.
pub trait MarketDataProvider {
    fn price_signal(&self, ts: u64) -> Option<MarketPriceSignal>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullMarketDataProvider;

impl MarketDataProvider for NullMarketDataProvider {
    fn price_signal(&self, _ts: u64) -> Option<MarketPriceSignal> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoPowerMode {
    #[serde(rename = "AUTO_AGC")]
    AutoAgc,
    #[serde(rename = "SAFE_STOP")]
    SafeStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryStats {
    pub window_ms: u64,
    pub points: usize,
    pub insulation_slope_kohm_per_hour: Option<f64>,
    pub delta_cell_slope_mv_per_hour: Option<f64>,
    pub soc_slope_pct_per_hour: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPowerInputs {
    pub system_soc_pct: Option<f64>,
    pub system_soh_pct: Option<f64>,
    pub system_load_pct: Option<f64>,
    pub system_average_voltage_v: Option<f64>,
    pub avg_soc_pct_from_units: Option<f64>,
    pub worst_insulation_resistance_kohm: Option<f64>,
    pub worst_delta_cell_voltage_mv: Option<f64>,
    pub max_temperature_c: Option<f64>,
    pub history: HistoryStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPowerDecision {
    pub ts: u64,
    pub active: bool,
    pub mode: AutoPowerMode,
    pub station_target_power_kw: f64,
    pub station_target_voltage_v: Option<f64>,
    pub power_limit_kw: f64,
    pub health_factor: f64,
    pub reasons: Vec<String>,
    pub rationale: Vec<String>,
    pub market: Option<MarketPriceSignal>,
    pub inputs: AutoPowerInputs,
    pub commands: ControlCommands,
}

fn clamp(v: f64, min: f64, max: f64) -> f64 {
    v.clamp(min, max)
}

/// Hermite ramp: 0 at or below `edge0`, 1 at or above `edge1`.
pub fn smoothstep(edge0: f64, edge1: f64, x: f64) -> f64 {
    if edge0 == edge1 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = clamp((x - edge0) / (edge1 - edge0), 0.0, 1.0);
    t * t * (2.0f64.mul_add(-t, 3.0))
}

/// 1 at or below `good_at_or_below`, 0 at or above `bad_at_or_above`.
pub fn smoothstep_decreasing(good_at_or_below: f64, bad_at_or_above: f64, x: f64) -> f64 {
    1.0 - smoothstep(good_at_or_below, bad_at_or_above, x)
}

fn slope_per_hour(series: &[(u64, f64)]) -> Option<f64> {
    let first = series.first()?;
    let last = series.last()?;
    if last.0 <= first.0 {
        return None;
    }
    let dt_hours = (last.0 - first.0) as f64 / 3_600_000.0;
    Some((last.1 - first.1) / dt_hours)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn push_reason(reasons: &mut Vec<String>, reason: &str) {
    if !reasons.iter().any(|r| r == reason) {
        reasons.push(String::from(reason));
    }
}

/// Moves `current` toward `target` by at most `max_step`, rounded to 0.1.
pub fn ramp_toward(current: f64, target: f64, max_step: f64) -> f64 {
    round1(current + (target - current).clamp(-max_step, max_step))
}

/// Whether the autonomous engine may drive the command plane.
///
/// A local hold never expires. A remote hold blocks while fresh, whether it
/// carries setpoints or an explicit stop, and goes stale after `ttl_ms`.
pub fn should_use_auto(stored: Option<&StoredCommand>, now: u64, ttl_ms: u64) -> bool {
    let Some(stored) = stored else {
        return true;
    };
    match stored.meta.actor {
        Actor::Auto => true,
        Actor::Local => false,
        Actor::Remote => now.saturating_sub(stored.ts) > ttl_ms,
    }
}

/// Whether the engine may also drive the voltage target. A local hold always
/// wins; a fresh remote hold wins only if it actually provided an AVC block.
pub fn should_auto_avc(stored: Option<&StoredCommand>, now: u64, ttl_ms: u64) -> bool {
    let Some(stored) = stored else {
        return true;
    };
    match stored.meta.actor {
        Actor::Local => false,
        Actor::Auto => true,
        Actor::Remote => {
            now.saturating_sub(stored.ts) > ttl_ms || !stored.meta.avc_provided
        }
    }
}

/// Read-only over the store: scores health, builds the proposed command
/// block, and explains itself in `reasons`/`rationale`.
pub fn compute_auto_power_decision<S, M>(
    store: &S,
    market: &M,
    cfg: &AutoPowerConfig,
    now: u64,
) -> AutoPowerDecision
where
    S: SnapshotStore + ?Sized,
    M: MarketDataProvider + ?Sized,
{
    let latest_units = store.latest_units();
    let latest_coordination = store.latest_coordination();
    let latest_telemetry = store.latest_telemetry();

    let units = latest_units.map_or(&[][..], |s| s.units.as_slice());
    let unit_count = units.len();

    let interlock_active = latest_coordination
        .is_some_and(|s| s.units.iter().any(|u| u.safety.interlock_active));

    let avg_soc_from_units = if unit_count == 0 {
        None
    } else {
        Some((units.iter().map(|u| u.bms.soc_pct).sum::<f64>() / unit_count as f64).round())
    };
    let worst_insulation = units
        .iter()
        .map(|u| u.bms.insulation_resistance_kohm)
        .min_by(f64::total_cmp);
    let worst_delta = units
        .iter()
        .map(|u| u.bms.delta_cell_voltage_mv)
        .max_by(f64::total_cmp);
    let max_temperature = units
        .iter()
        .map(|u| u.bms.temperature_c)
        .max_by(f64::total_cmp);

    let power_limit_kw = {
        let sum: f64 = latest_coordination.map_or(0.0, |s| {
            s.units
                .iter()
                .flat_map(|u| u.pcs.iter())
                .map(|p| p.adjustable_max_kw.max(0.0))
                .sum()
        });
        if sum > 0.0 {
            sum.round()
        } else if unit_count > 0 {
            unit_count as f64 * 180.0
        } else {
            cfg.fallback_limit_kw.max(0.0).round()
        }
    };

    let from = now.saturating_sub(cfg.history_window_ms);
    let unit_rows = store.units_between(from, now, cfg.max_history_points);
    let mut insulation_series: Vec<(u64, f64)> = Vec::with_capacity(unit_rows.len());
    let mut delta_series: Vec<(u64, f64)> = Vec::with_capacity(unit_rows.len());
    for row in &unit_rows {
        if let Some(worst) = row
            .units
            .iter()
            .map(|u| u.bms.insulation_resistance_kohm)
            .min_by(f64::total_cmp)
        {
            insulation_series.push((row.ts, worst));
        }
        if let Some(worst) = row
            .units
            .iter()
            .map(|u| u.bms.delta_cell_voltage_mv)
            .max_by(f64::total_cmp)
        {
            delta_series.push((row.ts, worst));
        }
    }
    let soc_series: Vec<(u64, f64)> = store
        .telemetry_between(from, now, cfg.max_history_points)
        .iter()
        .map(|r| (r.ts, r.system_soc_pct))
        .collect();

    let insulation_slope = slope_per_hour(&insulation_series);
    let delta_slope = slope_per_hour(&delta_series);
    let soc_slope = slope_per_hour(&soc_series);

    let mut reasons: Vec<String> = Vec::new();
    let mut rationale: Vec<String> = Vec::new();

    let faulted_count = units
        .iter()
        .filter(|u| u.status.is_error())
        .count();

    let mut hard_stop = false;
    if interlock_active {
        hard_stop = true;
        push_reason(&mut reasons, "safety interlock active");
    }
    if faulted_count > 0 {
        if faulted_count >= unit_count {
            hard_stop = true;
            push_reason(&mut reasons, "all battery units faulted");
        } else {
            reasons.push(format!(
                "battery unit faults detected: {faulted_count} unit(s) isolated at 0 kW, limit recomputed"
            ));
        }
    }

    let health_factor = if hard_stop {
        0.0
    } else {
        let insu_factor = worst_insulation.map_or(1.0, |v| smoothstep(120.0, 260.0, v));
        let delta_factor = worst_delta.map_or(1.0, |v| smoothstep_decreasing(40.0, 80.0, v));
        let temp_factor = max_temperature.map_or(1.0, |v| smoothstep_decreasing(45.0, 65.0, v));
        let insu_trend = insulation_slope.map_or(1.0, |v| smoothstep(-60.0, -10.0, v));
        let delta_trend = delta_slope.map_or(1.0, |v| smoothstep_decreasing(5.0, 25.0, v));
        let soc_trend = soc_slope.map_or(1.0, |v| smoothstep_decreasing(2.0, 6.0, v.abs()));
        let combined =
            insu_factor * delta_factor * temp_factor * insu_trend * delta_trend * soc_trend;

        if worst_insulation.is_some_and(|v| v < 200.0) {
            push_reason(&mut reasons, "insulation resistance low");
        }
        if worst_delta.is_some_and(|v| v >= 55.0) {
            push_reason(&mut reasons, "cell consistency deviation high");
        }
        if max_temperature.is_some_and(|v| v >= 54.0) {
            push_reason(&mut reasons, "temperature high");
        }
        if insulation_slope.is_some_and(|v| v < -30.0) {
            push_reason(&mut reasons, "insulation falling fast");
        }
        if delta_slope.is_some_and(|v| v > 12.0) {
            push_reason(&mut reasons, "cell delta rising fast");
        }
        if soc_slope.is_some_and(|v| v.abs() > 4.0) {
            push_reason(&mut reasons, "SOC moving fast");
        }

        clamp(combined, clamp(cfg.min_health_factor, 0.0, 1.0), 1.0)
    };

    let system_soc_pct = latest_telemetry.map(|t| t.system_soc_pct);
    let system_soh_pct = latest_telemetry.map(|t| t.system_soh_pct);
    let system_load_pct = latest_telemetry.map(|t| t.system_load_pct);
    let system_average_voltage_v = latest_telemetry.map(|t| t.average_voltage_v);

    let market_signal = market.price_signal(now);

    let limit = power_limit_kw.max(0.0);

    let base_from_load = system_load_pct.map_or(0.0, |load| {
        if limit <= 0.0 {
            return 0.0;
        }
        // Charge below 50% station load, discharge above 75%.
        let t = clamp((load - 50.0) / 25.0, 0.0, 1.0);
        let coeff = 0.5 + (-0.6 - 0.5) * t;
        coeff * limit
    });

    let soc_for_control = system_soc_pct.or(avg_soc_from_units);

    let base_from_soc = soc_for_control.map_or(0.0, |soc| {
        if limit <= 0.0 {
            return 0.0;
        }
        let err = soc - 60.0;
        if err.abs() <= 3.0 {
            return 0.0;
        }
        let k = clamp(err.abs() / 30.0, 0.0, 1.0);
        let mag = 0.4 * limit * k;
        if err > 0.0 { -mag } else { mag }
    });

    let base_from_market = market_signal.as_ref().map_or(0.0, |signal| {
        if limit <= 0.0 {
            return 0.0;
        }
        let z = if cfg.price_span_cny_per_mwh > 0.0 {
            clamp(
                (signal.price_cny_per_mwh - cfg.price_mid_cny_per_mwh)
                    / cfg.price_span_cny_per_mwh,
                -1.0,
                1.0,
            )
        } else {
            0.0
        };
        -z * clamp(cfg.price_scale, 0.0, 1.0) * limit
    });

    let mut target_unclamped = base_from_load + base_from_soc + base_from_market;

    if let Some(soh) = system_soh_pct {
        if soh < 92.0 {
            target_unclamped *= clamp((soh - 85.0) / 7.0, 0.4, 1.0);
            push_reason(&mut reasons, "SOH low, cycling intensity reduced");
        }
    }

    let active = limit > 0.0;
    let mut mode = AutoPowerMode::AutoAgc;
    let mut station_target_power_kw = 0.0;
    let mut station_target_voltage_v = None;

    if !active || health_factor == 0.0 {
        mode = AutoPowerMode::SafeStop;
        if !active {
            push_reason(&mut reasons, "no available power limit");
        }
    } else {
        let total_capacity_kwh = (unit_count as f64 * cfg.unit_capacity_kwh).max(0.0);
        let soc_for_energy = soc_for_control.unwrap_or(60.0);
        let charge_headroom_kwh =
            total_capacity_kwh * clamp((cfg.soc_max_pct - soc_for_energy) / 100.0, 0.0, 1.0);
        let discharge_headroom_kwh =
            total_capacity_kwh * clamp((soc_for_energy - cfg.soc_min_pct) / 100.0, 0.0, 1.0);
        let max_charge_kw = if cfg.energy_horizon_hours > 0.0 {
            charge_headroom_kwh / cfg.energy_horizon_hours
        } else {
            limit
        };
        let max_discharge_kw = if cfg.energy_horizon_hours > 0.0 {
            discharge_headroom_kwh / cfg.energy_horizon_hours
        } else {
            limit
        };
        let energy_limited = clamp(target_unclamped, -max_discharge_kw, max_charge_kw);
        station_target_power_kw = clamp(energy_limited, -limit, limit) * health_factor;

        let load = system_load_pct.unwrap_or(60.0);
        let load_bias = (clamp((load - 50.0) / 25.0, 0.0, 1.0) - 0.5) * 2.0;
        let soc_for_avc = soc_for_control.unwrap_or(60.0);
        // Low SOC nudges the bus voltage up a little.
        let soc_bias = clamp((60.0 - soc_for_avc) / 30.0, -1.0, 1.0);
        let v_err = system_average_voltage_v.map_or(0.0, |v| {
            clamp(
                cfg.voltage_nominal_v - v,
                -cfg.voltage_max_err_v.max(1.0),
                cfg.voltage_max_err_v.max(1.0),
            )
        });
        let delta_v = (clamp(cfg.voltage_kp, 0.0, 2.0) * v_err
            + clamp(cfg.voltage_load_comp_v, 0.0, 20.0) * load_bias
            + clamp(cfg.voltage_soc_comp_v, 0.0, 20.0) * soc_bias)
            * health_factor;
        station_target_voltage_v = Some(clamp(
            round1(cfg.voltage_nominal_v + delta_v),
            cfg.voltage_min_v,
            cfg.voltage_max_v,
        ));
    }

    station_target_power_kw = round1(station_target_power_kw);

    rationale.push(format!(
        "power limit={limit}kW, health factor={}",
        (health_factor * 100.0).round() / 100.0
    ));
    rationale.push(format!("load term={}kW", round1(base_from_load)));
    rationale.push(format!("SOC term={}kW", round1(base_from_soc)));
    rationale.push(format!("market term={}kW", round1(base_from_market)));
    if let Some(v) = station_target_voltage_v {
        match system_average_voltage_v {
            Some(meas) => rationale.push(format!("AVC target U={v}V (measured U={}V)", round1(meas))),
            None => rationale.push(format!("AVC target U={v}V")),
        }
    }
    if let Some(s) = insulation_slope {
        rationale.push(format!("insulation trend={}kOhm/h", round1(s)));
    }
    if let Some(s) = delta_slope {
        rationale.push(format!("cell delta trend={}mV/h", round1(s)));
    }
    if let Some(s) = soc_slope {
        rationale.push(format!("SOC trend={}%/h", round1(s)));
    }

    let mut commands = ControlCommands::default();
    if mode == AutoPowerMode::SafeStop {
        commands.agc.enabled = false;
        commands.agc.target_power_kw = 0.0;
        commands.manual_power.enabled = false;
        commands.manual_power.target_power_kw = 0.0;
        commands.avc.enabled = false;
    } else {
        commands.agc.enabled = true;
        commands.agc.target_power_kw = station_target_power_kw;
        if cfg.avc_enabled {
            if let Some(v) = station_target_voltage_v {
                commands.avc = AvcCommand {
                    enabled: true,
                    target_voltage_v: v,
                    range: VoltageRange {
                        min_v: cfg.voltage_min_v,
                        max_v: cfg.voltage_max_v,
                    },
                };
            }
        }
    }

    AutoPowerDecision {
        ts: now,
        active,
        mode,
        station_target_power_kw,
        station_target_voltage_v,
        power_limit_kw: limit,
        health_factor,
        reasons,
        rationale,
        market: market_signal,
        inputs: AutoPowerInputs {
            system_soc_pct,
            system_soh_pct,
            system_load_pct,
            system_average_voltage_v,
            avg_soc_pct_from_units: avg_soc_from_units,
            worst_insulation_resistance_kohm: worst_insulation,
            worst_delta_cell_voltage_mv: worst_delta,
            max_temperature_c: max_temperature,
            history: HistoryStats {
                window_ms: cfg.history_window_ms,
                points: unit_rows.len(),
                insulation_slope_kohm_per_hour: insulation_slope,
                delta_cell_slope_mv_per_hour: delta_slope,
                soc_slope_pct_per_hour: soc_slope,
            },
        },
        commands,
    }
}
