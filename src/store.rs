//! Snapshot persistence seam.
//!
//! The station agent records one row per tick for each stream it produces.
//! [`SnapshotStore`] is the seam; [`MemoryStore`] is the bounded in-memory
//! implementation the agent ships with. Rows are appended in timestamp order
//! and trimmed from the front once they fall out of the retention window.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::bus::FrameRecord;
use crate::plant::{BatteryUnit, CoordinationUnit};

/// Default retention window for every stream.
pub const DEFAULT_RETENTION_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub ts: u64,
    pub units: Vec<BatteryUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSnapshot {
    pub ts: u64,
    pub units: Vec<CoordinationUnit>,
}

/// Station-level telemetry aggregated from the plant each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTelemetry {
    pub ts: u64,
    pub system_soc_pct: f64,
    /// Percent, not fraction.
    pub system_soh_pct: f64,
    pub average_voltage_v: f64,
    pub average_temperature_c: f64,
    pub total_power_kw: f64,
    /// Station load as a percentage of the available power limit.
    pub system_load_pct: f64,
}

/// Append-only tick history. Queries are timestamp-windowed with an
/// ascending order and a row cap, matching how the decision engines read.
pub trait SnapshotStore {
    fn push_units(&mut self, snapshot: UnitSnapshot);
    fn push_coordination(&mut self, snapshot: CoordinationSnapshot);
    fn push_telemetry(&mut self, row: SystemTelemetry);
    fn push_frames(&mut self, frames: &[FrameRecord]);

    fn latest_units(&self) -> Option<&UnitSnapshot>;
    fn latest_coordination(&self) -> Option<&CoordinationSnapshot>;
    fn latest_telemetry(&self) -> Option<&SystemTelemetry>;

    /// Unit snapshots with `from <= ts <= to`, ascending, at most `limit`.
    fn units_between(&self, from: u64, to: u64, limit: usize) -> Vec<&UnitSnapshot>;
    /// Telemetry rows with `from <= ts <= to`, ascending, at most `limit`.
    fn telemetry_between(&self, from: u64, to: u64, limit: usize) -> Vec<&SystemTelemetry>;
    /// Frame records with `from <= ts <= to`, ascending, at most `limit`.
    fn frames_between(&self, from: u64, to: u64, limit: usize) -> Vec<&FrameRecord>;

    /// Drops rows older than `cutoff` from every stream.
    fn trim_before(&mut self, cutoff: u64);
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    units: VecDeque<UnitSnapshot>,
    coordination: VecDeque<CoordinationSnapshot>,
    telemetry: VecDeque<SystemTelemetry>,
    frames: VecDeque<FrameRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit_rows(&self) -> usize {
        self.units.len()
    }

    pub fn frame_rows(&self) -> usize {
        self.frames.len()
    }
}

fn window<'a, T, F>(rows: &'a VecDeque<T>, ts_of: F, from: u64, to: u64, limit: usize) -> Vec<&'a T>
where
    F: Fn(&T) -> u64,
{
    rows.iter()
        .filter(|r| {
            let ts = ts_of(r);
            ts >= from && ts <= to
        })
        .take(limit)
        .collect()
}

impl SnapshotStore for MemoryStore {
    fn push_units(&mut self, snapshot: UnitSnapshot) {
        self.units.push_back(snapshot);
    }

    fn push_coordination(&mut self, snapshot: CoordinationSnapshot) {
        self.coordination.push_back(snapshot);
    }

    fn push_telemetry(&mut self, row: SystemTelemetry) {
        self.telemetry.push_back(row);
    }

    fn push_frames(&mut self, frames: &[FrameRecord]) {
        self.frames.extend(frames.iter().cloned());
    }

    fn latest_units(&self) -> Option<&UnitSnapshot> {
        self.units.back()
    }

    fn latest_coordination(&self) -> Option<&CoordinationSnapshot> {
        self.coordination.back()
    }

    fn latest_telemetry(&self) -> Option<&SystemTelemetry> {
        self.telemetry.back()
    }

    fn units_between(&self, from: u64, to: u64, limit: usize) -> Vec<&UnitSnapshot> {
        window(&self.units, |r| r.ts, from, to, limit)
    }

    fn telemetry_between(&self, from: u64, to: u64, limit: usize) -> Vec<&SystemTelemetry> {
        window(&self.telemetry, |r| r.ts, from, to, limit)
    }

    fn frames_between(&self, from: u64, to: u64, limit: usize) -> Vec<&FrameRecord> {
        window(&self.frames, |r| r.ts, from, to, limit)
    }

    fn trim_before(&mut self, cutoff: u64) {
        while self.units.front().is_some_and(|r| r.ts < cutoff) {
            self.units.pop_front();
        }
        while self.coordination.front().is_some_and(|r| r.ts < cutoff) {
            self.coordination.pop_front();
        }
        while self.telemetry.front().is_some_and(|r| r.ts < cutoff) {
            self.telemetry.pop_front();
        }
        while self.frames.front().is_some_and(|r| r.ts < cutoff) {
            self.frames.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::PlantState;

    fn telemetry(ts: u64, soc: f64) -> SystemTelemetry {
        SystemTelemetry {
            ts,
            system_soc_pct: soc,
            system_soh_pct: 97.0,
            average_voltage_v: 752.0,
            average_temperature_c: 29.0,
            total_power_kw: 0.0,
            system_load_pct: 55.0,
        }
    }

    #[test]
    fn test_latest_returns_last_pushed_row() {
        let mut store = MemoryStore::new();
        store.push_telemetry(telemetry(1_000, 55.0));
        store.push_telemetry(telemetry(2_000, 56.0));
        assert_eq!(store.latest_telemetry().unwrap().ts, 2_000);
    }

    #[test]
    fn test_between_is_inclusive_ascending_and_capped() {
        let mut store = MemoryStore::new();
        for i in 1..=10 {
            store.push_telemetry(telemetry(i * 1_000, 50.0 + i as f64));
        }
        let rows = store.telemetry_between(2_000, 8_000, 100);
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[0].ts, 2_000);
        assert_eq!(rows[6].ts, 8_000);

        let capped = store.telemetry_between(0, u64::MAX, 3);
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[2].ts, 3_000);
    }

    #[test]
    fn test_trim_drops_old_rows_from_every_stream() {
        let plant = PlantState::new(2);
        let mut store = MemoryStore::new();
        for i in 1..=5 {
            store.push_units(UnitSnapshot {
                ts: i * 1_000,
                units: plant.units().to_vec(),
            });
            store.push_telemetry(telemetry(i * 1_000, 55.0));
        }
        store.trim_before(3_000);
        assert_eq!(store.unit_rows(), 3);
        assert_eq!(store.telemetry_between(0, u64::MAX, 100).len(), 3);
        assert_eq!(store.latest_units().unwrap().ts, 5_000);
    }
}
