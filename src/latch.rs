//! Per-unit fault latching.
//!
//! Each battery unit owns one latch row. A tick evaluates the unit's readings
//! against fixed warning/critical bands; the first breach latches the unit
//! until an operator reset. A reset opens a 60 s cooldown during which the
//! unit cannot re-latch, and a per-unit emit throttle keeps a flapping
//! reading from spamming the alarm stream.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

pub const RESET_COOLDOWN_MS: u64 = 60_000;
pub const EMIT_THROTTLE_MS: u64 = 20_000;

pub const INSULATION_CRITICAL_KOHM: f64 = 150.0;
pub const INSULATION_WARNING_KOHM: f64 = 260.0;
pub const CELL_DELTA_CRITICAL_MV: f64 = 65.0;
pub const CELL_DELTA_WARNING_MV: f64 = 45.0;
pub const CELL_TEMP_CRITICAL_C: f64 = 60.0;
pub const CELL_TEMP_WARNING_C: f64 = 52.0;
pub const PCS_TEMP_WARNING_C: f64 = 52.0;

const MAX_CANDIDATES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatchReason {
    CriticalAlarm,
    WarningAlarm,
}

impl core::fmt::Display for LatchReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LatchReason::CriticalAlarm => write!(f, "critical_alarm"),
            LatchReason::WarningAlarm => write!(f, "warning_alarm"),
        }
    }
}

/// One unit's latch row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LatchRecord {
    pub unit_id: u8,
    pub latched: bool,
    pub latched_at: Option<u64>,
    pub reason: Option<LatchReason>,
    pub last_reset_at: Option<u64>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccurrenceState {
    Active,
    Resolved,
}

/// Structured alarm row appended when a unit latches or resets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmOccurrence {
    pub ts: u64,
    pub unit_id: u8,
    pub source: String,
    pub device: String,
    pub kind: String,
    pub level: AlarmLevel,
    pub description: String,
    pub state: OccurrenceState,
}

/// Operator-facing notification mirroring the alarm stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorNotification {
    pub ts: u64,
    pub unit_id: u8,
    pub level: AlarmLevel,
    pub message: String,
    pub acknowledged: bool,
}

/// Readings a latch scan looks at, already reduced to the unit's worst cell.
#[derive(Debug, Clone, Copy)]
pub struct UnitReadings {
    pub insulation_resistance_kohm: f64,
    pub delta_cell_voltage_mv: f64,
    pub max_cell_temp_c: f64,
    pub pcs_temperature_c: f64,
}

/// Outcome of one latch scan for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatchDecision {
    /// Nothing to do; readings are inside the bands.
    Normal,
    /// The unit is already latched; keep enforcing the fault.
    AlreadyLatched,
    /// A recent reset suppresses re-latching.
    Cooldown,
    /// A band was breached but the emit throttle is still open.
    Throttled,
    /// The unit latched on this scan.
    Latched {
        reason: LatchReason,
        description: String,
    },
}

/// Successful unit reset acknowledgement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub ok: bool,
    pub unit_id: u8,
    pub reset_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    level: AlarmLevel,
    source: &'static str,
    kind: &'static str,
}

impl Candidate {
    fn describe(&self, readings: &UnitReadings) -> String {
        match self.kind {
            "insulation_low" => format!(
                "insulation resistance {:.0} kOhm at or below {} threshold",
                readings.insulation_resistance_kohm,
                level_word(self.level)
            ),
            "cell_delta_high" => format!(
                "cell voltage delta {:.0} mV at or above {} threshold",
                readings.delta_cell_voltage_mv,
                level_word(self.level)
            ),
            "cell_temp_high" => format!(
                "max cell temperature {:.0} C at or above {} threshold",
                readings.max_cell_temp_c,
                level_word(self.level)
            ),
            _ => format!(
                "PCS temperature {:.0} C at or above {} threshold",
                readings.pcs_temperature_c,
                level_word(self.level)
            ),
        }
    }
}

fn level_word(level: AlarmLevel) -> &'static str {
    match level {
        AlarmLevel::Critical => "critical",
        AlarmLevel::Warning => "warning",
        AlarmLevel::Info => "info",
    }
}

/// All latch state for the plant, plus the alarm and notification streams.
#[derive(Debug, Default)]
pub struct LatchStore {
    records: BTreeMap<u8, LatchRecord>,
    last_emit: BTreeMap<u8, u64>,
    occurrences: Vec<AlarmOccurrence>,
    notifications: Vec<OperatorNotification>,
}

impl LatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, unit_id: u8) -> LatchRecord {
        self.records.get(&unit_id).copied().unwrap_or_else(|| LatchRecord {
            unit_id,
            ..LatchRecord::default()
        })
    }

    pub fn is_latched(&self, unit_id: u8) -> bool {
        self.records.get(&unit_id).is_some_and(|r| r.latched)
    }

    pub fn latched_units(&self) -> Vec<u8> {
        self.records
            .values()
            .filter(|r| r.latched)
            .map(|r| r.unit_id)
            .collect()
    }

    pub fn occurrences(&self) -> &[AlarmOccurrence] {
        &self.occurrences
    }

    pub fn notifications(&self) -> &[OperatorNotification] {
        &self.notifications
    }

    /// One scan for one unit. Latching is monotonic: once this returns
    /// [`LatchDecision::Latched`], later scans return `AlreadyLatched` until
    /// a reset.
    pub fn evaluate(&mut self, unit_id: u8, readings: &UnitReadings, ts: u64) -> LatchDecision {
        if self.is_latched(unit_id) {
            return LatchDecision::AlreadyLatched;
        }
        if let Some(reset_at) = self.records.get(&unit_id).and_then(|r| r.last_reset_at) {
            if ts.saturating_sub(reset_at) < RESET_COOLDOWN_MS {
                return LatchDecision::Cooldown;
            }
        }

        let Some(picked) = pick_candidate(readings) else {
            return LatchDecision::Normal;
        };

        if let Some(last) = self.last_emit.get(&unit_id) {
            if ts.saturating_sub(*last) < EMIT_THROTTLE_MS {
                return LatchDecision::Throttled;
            }
        }
        self.last_emit.insert(unit_id, ts);

        let reason = match picked.level {
            AlarmLevel::Critical => LatchReason::CriticalAlarm,
            _ => LatchReason::WarningAlarm,
        };
        let description = picked.describe(readings);

        let row = self.records.entry(unit_id).or_insert_with(|| LatchRecord {
            unit_id,
            ..LatchRecord::default()
        });
        row.latched = true;
        row.latched_at = Some(ts);
        row.reason = Some(reason);
        row.updated_at = ts;

        self.occurrences.push(AlarmOccurrence {
            ts,
            unit_id,
            source: String::from(picked.source),
            device: format!("unit-{unit_id}"),
            kind: String::from("latched"),
            level: AlarmLevel::Critical,
            description: description.clone(),
            state: OccurrenceState::Active,
        });
        self.notifications.push(OperatorNotification {
            ts,
            unit_id,
            level: AlarmLevel::Critical,
            message: format!("unit {unit_id} latched: {description}"),
            acknowledged: false,
        });

        LatchDecision::Latched {
            reason,
            description,
        }
    }

    /// Operator reset. Idempotent; unknown units become a reset row so the
    /// cooldown still applies to them.
    pub fn reset(&mut self, unit_id: u8, ts: u64, actor: &str) -> ResetOutcome {
        let row = self.records.entry(unit_id).or_insert_with(|| LatchRecord {
            unit_id,
            ..LatchRecord::default()
        });
        row.latched = false;
        row.latched_at = None;
        row.reason = None;
        row.last_reset_at = Some(ts);
        row.updated_at = ts;

        for occ in &mut self.occurrences {
            if occ.unit_id == unit_id && occ.state == OccurrenceState::Active {
                occ.state = OccurrenceState::Resolved;
            }
        }

        self.occurrences.push(AlarmOccurrence {
            ts,
            unit_id,
            source: String::from("operator"),
            device: format!("unit-{unit_id}"),
            kind: String::from("manual_reset"),
            level: AlarmLevel::Info,
            description: format!("manual reset by {actor}"),
            state: OccurrenceState::Resolved,
        });
        self.notifications.push(OperatorNotification {
            ts,
            unit_id,
            level: AlarmLevel::Info,
            message: format!("unit {unit_id} reset by {actor}"),
            acknowledged: false,
        });

        ResetOutcome {
            ok: true,
            unit_id,
            reset_at: ts,
        }
    }
}

/// Orders candidates worst-first: any critical breach outranks every warning.
fn pick_candidate(readings: &UnitReadings) -> Option<Candidate> {
    let mut candidates: heapless::Vec<Candidate, MAX_CANDIDATES> = heapless::Vec::new();
    let mut push = |c: Candidate| {
        // NASA Rule 5: capacity covers one candidate per reading
        debug_assert!(candidates.len() < MAX_CANDIDATES);
        let _ = candidates.push(c);
    };

    if readings.insulation_resistance_kohm <= INSULATION_CRITICAL_KOHM {
        push(Candidate {
            level: AlarmLevel::Critical,
            source: "BMS",
            kind: "insulation_low",
        });
    } else if readings.insulation_resistance_kohm <= INSULATION_WARNING_KOHM {
        push(Candidate {
            level: AlarmLevel::Warning,
            source: "BMS",
            kind: "insulation_low",
        });
    }

    if readings.delta_cell_voltage_mv >= CELL_DELTA_CRITICAL_MV {
        push(Candidate {
            level: AlarmLevel::Critical,
            source: "BMS",
            kind: "cell_delta_high",
        });
    } else if readings.delta_cell_voltage_mv >= CELL_DELTA_WARNING_MV {
        push(Candidate {
            level: AlarmLevel::Warning,
            source: "BMS",
            kind: "cell_delta_high",
        });
    }

    if readings.max_cell_temp_c >= CELL_TEMP_CRITICAL_C {
        push(Candidate {
            level: AlarmLevel::Critical,
            source: "BMS",
            kind: "cell_temp_high",
        });
    } else if readings.max_cell_temp_c >= CELL_TEMP_WARNING_C {
        push(Candidate {
            level: AlarmLevel::Warning,
            source: "BMS",
            kind: "cell_temp_high",
        });
    }

    if readings.pcs_temperature_c >= PCS_TEMP_WARNING_C {
        push(Candidate {
            level: AlarmLevel::Warning,
            source: "PCS",
            kind: "pcs_temp_high",
        });
    }

    candidates
        .iter()
        .find(|c| c.level == AlarmLevel::Critical)
        .or_else(|| candidates.first())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nominal() -> UnitReadings {
        UnitReadings {
            insulation_resistance_kohm: 520.0,
            delta_cell_voltage_mv: 22.0,
            max_cell_temp_c: 30.0,
            pcs_temperature_c: 36.0,
        }
    }

    #[test]
    fn test_nominal_readings_do_not_latch() {
        let mut store = LatchStore::new();
        assert_eq!(store.evaluate(1, &nominal(), 1_000), LatchDecision::Normal);
        assert!(!store.is_latched(1));
        assert!(store.occurrences().is_empty());
    }

    #[test]
    fn test_critical_insulation_latches_and_sticks() {
        let mut store = LatchStore::new();
        let mut bad = nominal();
        bad.insulation_resistance_kohm = 140.0;
        let decision = store.evaluate(3, &bad, 1_000);
        match decision {
            LatchDecision::Latched { reason, .. } => {
                assert_eq!(reason, LatchReason::CriticalAlarm);
            }
            other => panic!("expected latch, got {other:?}"),
        }
        assert!(store.is_latched(3));
        assert_eq!(store.occurrences().len(), 1);
        assert_eq!(store.occurrences()[0].state, OccurrenceState::Active);

        // Later scans, even with recovered readings, stay latched.
        assert_eq!(store.evaluate(3, &nominal(), 30_000), LatchDecision::AlreadyLatched);
        assert_eq!(store.occurrences().len(), 1);
    }

    #[test]
    fn test_critical_outranks_warning() {
        let mut store = LatchStore::new();
        let mut bad = nominal();
        bad.insulation_resistance_kohm = 250.0; // warning band
        bad.max_cell_temp_c = 61.0; // critical band
        match store.evaluate(1, &bad, 1_000) {
            LatchDecision::Latched { reason, description } => {
                assert_eq!(reason, LatchReason::CriticalAlarm);
                assert!(description.contains("cell temperature"));
            }
            other => panic!("expected latch, got {other:?}"),
        }
    }

    #[test]
    fn test_warning_band_latches_with_warning_reason() {
        let mut store = LatchStore::new();
        let mut bad = nominal();
        bad.delta_cell_voltage_mv = 50.0;
        match store.evaluate(2, &bad, 1_000) {
            LatchDecision::Latched { reason, .. } => {
                assert_eq!(reason, LatchReason::WarningAlarm);
            }
            other => panic!("expected latch, got {other:?}"),
        }
    }

    #[test]
    fn test_reset_cooldown_suppresses_relatch() {
        let mut store = LatchStore::new();
        let mut bad = nominal();
        bad.insulation_resistance_kohm = 100.0;
        assert!(matches!(store.evaluate(1, &bad, 1_000), LatchDecision::Latched { .. }));

        let reset = store.reset(1, 10_000, "operator");
        assert!(reset.ok);
        assert!(!store.is_latched(1));

        // Still inside the 60 s cooldown window.
        assert_eq!(store.evaluate(1, &bad, 40_000), LatchDecision::Cooldown);
        assert!(!store.is_latched(1));

        // Window over: the breach latches again.
        assert!(matches!(store.evaluate(1, &bad, 70_001), LatchDecision::Latched { .. }));
    }

    #[test]
    fn test_reset_resolves_open_occurrences() {
        let mut store = LatchStore::new();
        let mut bad = nominal();
        bad.insulation_resistance_kohm = 100.0;
        store.evaluate(5, &bad, 1_000);
        store.reset(5, 2_000, "operator");

        assert_eq!(store.occurrences().len(), 2);
        assert!(store
            .occurrences()
            .iter()
            .all(|o| o.state == OccurrenceState::Resolved));
        assert_eq!(store.occurrences()[1].kind, "manual_reset");
        assert_eq!(store.occurrences()[1].level, AlarmLevel::Info);
    }

    #[test]
    fn test_emit_throttle_blocks_rapid_relatch() {
        let mut store = LatchStore::new();
        let mut bad = nominal();
        bad.delta_cell_voltage_mv = 70.0;
        assert!(matches!(store.evaluate(1, &bad, 100_000), LatchDecision::Latched { .. }));
        store.reset(1, 101_000, "operator");
        // Move the reset far enough back that only the emit throttle of the
        // 100 s latch event is in play.
        store.records.get_mut(&1).unwrap().last_reset_at = Some(101_000 - RESET_COOLDOWN_MS);

        assert_eq!(store.evaluate(1, &bad, 110_000), LatchDecision::Throttled);
        // Throttle window over: latches again.
        assert!(matches!(store.evaluate(1, &bad, 120_001), LatchDecision::Latched { .. }));
    }

    #[test]
    fn test_reset_unknown_unit_is_noop_success() {
        let mut store = LatchStore::new();
        let outcome = store.reset(9, 5_000, "operator");
        assert!(outcome.ok);
        assert_eq!(outcome.unit_id, 9);
        assert!(!store.is_latched(9));
    }
}
