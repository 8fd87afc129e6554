//! Authoritative control commands.
//!
//! One current command block (AGC, AVC, manual power) plus who wrote it and
//! which sections they actually provided. Writes are normalized: missing
//! sections fall back to defaults, numeric fields are clamped, and manual
//! power and AGC are mutually exclusive with manual winning. Every write
//! also lands in an append-only audit list.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

pub const RAMP_RATE_MIN_KW_PER_MIN: f64 = 1.0;
pub const RAMP_RATE_MAX_KW_PER_MIN: f64 = 120.0;
pub const DEFAULT_RAMP_RATE_KW_PER_MIN: f64 = 20.0;
pub const DEFAULT_DEADBAND_KW: f64 = 5.0;
pub const DEFAULT_TARGET_VOLTAGE_V: f64 = 400.0;
pub const DEFAULT_VOLTAGE_MIN_V: f64 = 380.0;
pub const DEFAULT_VOLTAGE_MAX_V: f64 = 420.0;

/// Who issued a command write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Local,
    Remote,
    Auto,
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Actor::Local => write!(f, "local"),
            Actor::Remote => write!(f, "remote"),
            Actor::Auto => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgcCommand {
    pub enabled: bool,
    pub target_power_kw: f64,
    pub ramp_rate_kw_per_min: f64,
    pub deadband_kw: f64,
}

impl Default for AgcCommand {
    fn default() -> Self {
        Self {
            enabled: false,
            target_power_kw: 0.0,
            ramp_rate_kw_per_min: DEFAULT_RAMP_RATE_KW_PER_MIN,
            deadband_kw: DEFAULT_DEADBAND_KW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    pub min_v: f64,
    pub max_v: f64,
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self {
            min_v: DEFAULT_VOLTAGE_MIN_V,
            max_v: DEFAULT_VOLTAGE_MAX_V,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvcCommand {
    pub enabled: bool,
    pub target_voltage_v: f64,
    pub range: VoltageRange,
}

impl Default for AvcCommand {
    fn default() -> Self {
        Self {
            enabled: false,
            target_voltage_v: DEFAULT_TARGET_VOLTAGE_V,
            range: VoltageRange::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ManualPowerCommand {
    pub enabled: bool,
    pub target_power_kw: f64,
}

/// The full command block the station acts on.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlCommands {
    pub agc: AgcCommand,
    pub avc: AvcCommand,
    pub manual_power: ManualPowerCommand,
}

impl ControlCommands {
    /// True when any setpoint section is enabled.
    pub fn has_active_setpoint(&self) -> bool {
        self.agc.enabled || self.avc.enabled || self.manual_power.enabled
    }

    /// True when every target is zero, counting the AVC target only while
    /// AVC is enabled.
    pub fn targets_all_zero(&self) -> bool {
        let avc_target = if self.avc.enabled {
            self.avc.target_voltage_v
        } else {
            0.0
        };
        self.agc.target_power_kw == 0.0
            && self.manual_power.target_power_kw == 0.0
            && avc_target == 0.0
    }
}

/// Which sections the writer actually supplied, captured at write time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CommandMeta {
    pub actor: Actor,
    pub agc_provided: bool,
    pub avc_provided: bool,
    pub manual_power_provided: bool,
}

/// A command write as the store keeps it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StoredCommand {
    pub ts: u64,
    pub commands: ControlCommands,
    pub meta: CommandMeta,
}

/// Incoming write; absent sections keep their defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    pub agc: Option<AgcCommand>,
    pub avc: Option<AvcCommand>,
    pub manual_power: Option<ManualPowerCommand>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: u64,
    pub actor: Actor,
    pub commands: ControlCommands,
}

#[derive(Debug, Default)]
pub struct CommandStore {
    current: Option<StoredCommand>,
    audit: Vec<AuditEntry>,
}

impl CommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&StoredCommand> {
        self.current.as_ref()
    }

    /// Commands the station acts on this tick: the stored block, or defaults
    /// before the first write.
    pub fn effective(&self) -> ControlCommands {
        self.current.map_or_else(ControlCommands::default, |c| c.commands)
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Operator write. Normalizes each provided section, records which
    /// sections were provided, and enforces manual/AGC exclusivity with
    /// manual power winning.
    pub fn set(&mut self, request: CommandRequest, actor: Actor, ts: u64) -> ControlCommands {
        let mut commands = ControlCommands {
            agc: sanitize_agc(request.agc.unwrap_or_default()),
            avc: sanitize_avc(request.avc.unwrap_or_default()),
            manual_power: sanitize_manual(request.manual_power.unwrap_or_default()),
        };
        if commands.manual_power.enabled {
            commands.agc.enabled = false;
        }
        let meta = CommandMeta {
            actor,
            agc_provided: request.agc.is_some(),
            avc_provided: request.avc.is_some(),
            manual_power_provided: request.manual_power.is_some(),
        };
        self.current = Some(StoredCommand { ts, commands, meta });
        self.audit.push(AuditEntry { ts, actor, commands });
        commands
    }

    /// Write-back from the autonomous engine. A rewrite identical to the
    /// current auto block is skipped so the audit list stays quiet between
    /// changes.
    pub fn write_auto(&mut self, commands: ControlCommands, ts: u64) {
        if let Some(current) = &self.current {
            if current.meta.actor == Actor::Auto && current.commands == commands {
                return;
            }
        }
        self.current = Some(StoredCommand {
            ts,
            commands,
            meta: CommandMeta {
                actor: Actor::Auto,
                agc_provided: true,
                avc_provided: true,
                manual_power_provided: true,
            },
        });
        self.audit.push(AuditEntry {
            ts,
            actor: Actor::Auto,
            commands,
        });
    }
}

fn finite_or(v: f64, fallback: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        fallback
    }
}

fn sanitize_agc(mut agc: AgcCommand) -> AgcCommand {
    agc.target_power_kw = finite_or(agc.target_power_kw, 0.0);
    agc.ramp_rate_kw_per_min = finite_or(agc.ramp_rate_kw_per_min, DEFAULT_RAMP_RATE_KW_PER_MIN)
        .clamp(RAMP_RATE_MIN_KW_PER_MIN, RAMP_RATE_MAX_KW_PER_MIN);
    agc.deadband_kw = finite_or(agc.deadband_kw, DEFAULT_DEADBAND_KW).max(0.0);
    agc
}

fn sanitize_avc(mut avc: AvcCommand) -> AvcCommand {
    if !avc.range.min_v.is_finite()
        || !avc.range.max_v.is_finite()
        || avc.range.min_v > avc.range.max_v
    {
        avc.range = VoltageRange::default();
    }
    avc.target_voltage_v = finite_or(avc.target_voltage_v, DEFAULT_TARGET_VOLTAGE_V)
        .clamp(avc.range.min_v, avc.range.max_v);
    avc
}

fn sanitize_manual(mut manual: ManualPowerCommand) -> ManualPowerCommand {
    manual.target_power_kw = finite_or(manual.target_power_kw, 0.0);
    manual
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_before_first_write() {
        let store = CommandStore::new();
        let commands = store.effective();
        assert!(!commands.has_active_setpoint());
        assert!((commands.agc.ramp_rate_kw_per_min - 20.0).abs() < 1e-9);
        assert!((commands.avc.target_voltage_v - 400.0).abs() < 1e-9);
        assert!(store.audit().is_empty());
    }

    #[test]
    fn test_manual_power_wins_over_agc() {
        let mut store = CommandStore::new();
        let commands = store.set(
            CommandRequest {
                agc: Some(AgcCommand {
                    enabled: true,
                    target_power_kw: 500.0,
                    ..AgcCommand::default()
                }),
                manual_power: Some(ManualPowerCommand {
                    enabled: true,
                    target_power_kw: 150.0,
                }),
                avc: None,
            },
            Actor::Local,
            1_000,
        );
        assert!(commands.manual_power.enabled);
        assert!(!commands.agc.enabled);
        // The AGC target survives even though the section is forced off.
        assert!((commands.agc.target_power_kw - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_ramp_rate_clamped() {
        let mut store = CommandStore::new();
        let commands = store.set(
            CommandRequest {
                agc: Some(AgcCommand {
                    enabled: true,
                    target_power_kw: 100.0,
                    ramp_rate_kw_per_min: 900.0,
                    deadband_kw: -3.0,
                }),
                ..CommandRequest::default()
            },
            Actor::Local,
            1_000,
        );
        assert!((commands.agc.ramp_rate_kw_per_min - 120.0).abs() < 1e-9);
        assert!((commands.agc.deadband_kw - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_avc_target_clamped_into_range() {
        let mut store = CommandStore::new();
        let commands = store.set(
            CommandRequest {
                avc: Some(AvcCommand {
                    enabled: true,
                    target_voltage_v: 500.0,
                    range: VoltageRange::default(),
                }),
                ..CommandRequest::default()
            },
            Actor::Remote,
            1_000,
        );
        assert!((commands.avc.target_voltage_v - 420.0).abs() < 1e-9);
    }

    #[test]
    fn test_provided_flags_follow_request_sections() {
        let mut store = CommandStore::new();
        store.set(
            CommandRequest {
                agc: Some(AgcCommand::default()),
                ..CommandRequest::default()
            },
            Actor::Remote,
            1_000,
        );
        let meta = store.current().unwrap().meta;
        assert!(meta.agc_provided);
        assert!(!meta.avc_provided);
        assert!(!meta.manual_power_provided);
    }

    #[test]
    fn test_every_write_is_audited() {
        let mut store = CommandStore::new();
        store.set(CommandRequest::default(), Actor::Local, 1_000);
        store.set(CommandRequest::default(), Actor::Remote, 2_000);
        assert_eq!(store.audit().len(), 2);
        assert_eq!(store.audit()[1].actor, Actor::Remote);
    }

    #[test]
    fn test_auto_rewrite_of_identical_block_is_skipped() {
        let mut store = CommandStore::new();
        let mut commands = ControlCommands::default();
        commands.agc.enabled = true;
        commands.agc.target_power_kw = 300.0;
        store.write_auto(commands, 1_000);
        store.write_auto(commands, 2_000);
        assert_eq!(store.audit().len(), 1);
        assert_eq!(store.current().unwrap().ts, 1_000);

        commands.agc.target_power_kw = 360.0;
        store.write_auto(commands, 3_000);
        assert_eq!(store.audit().len(), 2);
    }

    #[test]
    fn test_targets_all_zero_ignores_disabled_avc() {
        let mut commands = ControlCommands::default();
        // Disabled AVC keeps its 400 V default target.
        assert!(commands.targets_all_zero());
        commands.avc.enabled = true;
        assert!(!commands.targets_all_zero());
    }
}
