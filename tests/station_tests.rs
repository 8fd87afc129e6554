use plantbus::autopower::REMOTE_HOLD_TTL_MS;
use plantbus::command::{
    Actor, AgcCommand, AvcCommand, CommandRequest, ManualPowerCommand, VoltageRange,
};
use plantbus::latch::INSULATION_CRITICAL_KOHM;
use plantbus::protection::{DecisionMode, LimitReason, ProtectionDeviceName};
use plantbus::station::DEFAULT_TICK_INTERVAL_MS;
use plantbus::{SnapshotStore, StationAgent, StationConfig, TickReport};

fn run_ticks(agent: &mut StationAgent, first: u64, last: u64) -> TickReport {
    let mut report = None;
    for i in first..=last {
        report = Some(agent.tick(i * DEFAULT_TICK_INTERVAL_MS));
    }
    report.expect("at least one tick")
}

fn agc_request(target_kw: f64) -> CommandRequest {
    CommandRequest {
        agc: Some(AgcCommand {
            enabled: true,
            target_power_kw: target_kw,
            ramp_rate_kw_per_min: 20.0,
            deadband_kw: 5.0,
        }),
        avc: None,
        manual_power: None,
    }
}

#[test]
fn test_clean_plant_tracks_operator_agc_target() {
    let mut agent = StationAgent::new();
    agent.apply_commands(agc_request(300.0), Actor::Local, 0);

    let report = run_ticks(&mut agent, 1, 40);

    // A local hold keeps the autonomous engine out.
    assert!(report.auto.is_none());
    assert!((agent.plant().total_actual_kw() - 300.0).abs() < 1.0);
    assert!(report.ems.ready);
    assert_eq!(report.ems.mode, DecisionMode::Agc);
    assert!((report.ems.station_target_power_kw - 300.0).abs() < 1e-9);
    assert!(report.latched_units.is_empty());
    assert!(agent.occurrences().is_empty());
    assert!(!report.frames.is_empty());
    assert!(report.frames.iter().all(|f| f.error.is_none()));
}

#[test]
fn test_manual_override_wins_over_agc() {
    let mut agent = StationAgent::new();
    let applied = agent.apply_commands(
        CommandRequest {
            agc: Some(AgcCommand {
                enabled: true,
                target_power_kw: 200.0,
                ramp_rate_kw_per_min: 20.0,
                deadband_kw: 5.0,
            }),
            avc: None,
            manual_power: Some(ManualPowerCommand {
                enabled: true,
                target_power_kw: 100.0,
            }),
        },
        Actor::Local,
        0,
    );
    assert!(!applied.agc.enabled);
    assert!(applied.manual_power.enabled);

    run_ticks(&mut agent, 1, 40);
    assert!((agent.plant().total_actual_kw() - 100.0).abs() < 1.0);
}

#[test]
fn test_insulation_breach_isolates_unit_and_derates() {
    let mut agent = StationAgent::new();
    agent.apply_commands(agc_request(300.0), Actor::Local, 0);
    run_ticks(&mut agent, 1, 20);

    agent
        .plant_mut()
        .unit_mut(5)
        .unwrap()
        .bms
        .insulation_resistance_kohm = INSULATION_CRITICAL_KOHM - 10.0;
    let report = agent.tick(21 * DEFAULT_TICK_INTERVAL_MS);
    assert_eq!(report.latched_units, [5]);
    assert_eq!(report.new_occurrences.len(), 1);
    assert!(report.new_occurrences[0].description.contains("insulation"));

    let report = run_ticks(&mut agent, 22, 45);
    // The faulted unit is pinned to zero while the others keep producing.
    assert_eq!(agent.plant().unit(5).unwrap().pcs.actual_kw, 0.0);
    assert!(agent.plant().total_actual_kw() < 300.0);
    assert!(agent.plant().total_actual_kw() > 200.0);
    assert_eq!(report.ems.mode, DecisionMode::Limited);
    // The faulted unit's device status propagates into its frame status, so
    // the comm derate (0.75) wins over the field derate.
    assert_eq!(report.ems.limit_reason, Some(LimitReason::CommDegraded));
    assert!((report.ems.station_target_power_kw - 225.0).abs() < 1e-9);
    // One bad unit never stops the station.
    assert!(report.ems.ready);
}

#[test]
fn test_imd_trip_forces_safe_stop_until_protection_reset() {
    let mut agent = StationAgent::new();
    agent.apply_commands(agc_request(200.0), Actor::Local, 0);
    run_ticks(&mut agent, 1, 5);

    // Insulation below the IMD trip band plus the resulting unit fault is a
    // hard trigger: the IMD latches and the station safe-stops.
    agent
        .plant_mut()
        .unit_mut(2)
        .unwrap()
        .bms
        .insulation_resistance_kohm = 100.0;
    let report = agent.tick(6 * DEFAULT_TICK_INTERVAL_MS);
    assert_eq!(report.latched_units, [2]);
    assert!(!report.ems.ready);
    assert_eq!(report.ems.mode, DecisionMode::SafeStop);
    assert_eq!(report.ems.station_target_power_kw, 0.0);

    // Healing the reading and resetting the unit is not enough; the trip
    // latch holds until the protection device itself is reset.
    agent
        .plant_mut()
        .unit_mut(2)
        .unwrap()
        .bms
        .insulation_resistance_kohm = 500.0;
    let outcome = agent.reset_unit(2, 7 * DEFAULT_TICK_INTERVAL_MS, "operator");
    assert!(outcome.ok);
    let report = agent.tick(8 * DEFAULT_TICK_INTERVAL_MS);
    assert_eq!(report.ems.mode, DecisionMode::SafeStop);

    assert!(agent.reset_protection_device(ProtectionDeviceName::InsulationMonitor));
    let report = agent.tick(9 * DEFAULT_TICK_INTERVAL_MS);
    assert!(report.ems.ready);
    assert_eq!(report.ems.mode, DecisionMode::Agc);
}

#[test]
fn test_remote_explicit_stop_blocks_auto_until_ttl() {
    let mut agent = StationAgent::new();
    run_ticks(&mut agent, 1, 3);

    let stop_ts = 3 * DEFAULT_TICK_INTERVAL_MS;
    agent.apply_commands(
        CommandRequest {
            agc: Some(AgcCommand {
                enabled: false,
                target_power_kw: 0.0,
                ramp_rate_kw_per_min: 20.0,
                deadband_kw: 5.0,
            }),
            avc: None,
            manual_power: None,
        },
        Actor::Remote,
        stop_ts,
    );

    let report = run_ticks(&mut agent, 4, 10);
    assert!(report.auto.is_none());
    assert!(!report.commands.agc.enabled);
    assert!(agent.plant().total_actual_kw().abs() < 1.0);

    // Past the remote TTL the hold goes stale and the engine takes over.
    let report = agent.tick(stop_ts + REMOTE_HOLD_TTL_MS + DEFAULT_TICK_INTERVAL_MS);
    assert!(report.auto.is_some());
    assert!(report.commands.agc.enabled);
}

#[test]
fn test_remote_avc_hold_keeps_auto_out_while_fresh() {
    let mut agent = StationAgent::new();
    run_ticks(&mut agent, 1, 3);

    let hold_ts = 3 * DEFAULT_TICK_INTERVAL_MS;
    agent.apply_commands(
        CommandRequest {
            agc: None,
            avc: Some(AvcCommand {
                enabled: true,
                target_voltage_v: 410.0,
                range: VoltageRange {
                    min_v: 380.0,
                    max_v: 420.0,
                },
            }),
            manual_power: None,
        },
        Actor::Remote,
        hold_ts,
    );

    let report = run_ticks(&mut agent, 4, 8);
    assert!(report.auto.is_none());
    assert!(report.commands.avc.enabled);
    assert_eq!(report.commands.avc.target_voltage_v, 410.0);
    assert_eq!(report.ems.station_target_voltage_v, Some(410.0));

    let report = agent.tick(hold_ts + REMOTE_HOLD_TTL_MS + DEFAULT_TICK_INTERVAL_MS);
    assert!(report.auto.is_some());
}

#[test]
fn test_audit_records_every_operator_write() {
    let mut agent = StationAgent::with_config(StationConfig {
        auto_enabled: false,
        ..StationConfig::default()
    });
    agent.apply_commands(agc_request(150.0), Actor::Local, 1_000);
    agent.apply_commands(agc_request(250.0), Actor::Remote, 2_000);
    run_ticks(&mut agent, 2, 10);

    let audit = agent.audit();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].actor, Actor::Local);
    assert_eq!(audit[1].actor, Actor::Remote);
    assert!((agent.effective_commands().agc.target_power_kw - 250.0).abs() < 1e-9);
}

#[test]
fn test_snapshot_store_retains_tick_history() {
    let mut agent = StationAgent::new();
    run_ticks(&mut agent, 1, 20);

    let store = agent.store();
    assert_eq!(store.unit_rows(), 20);
    let telemetry = store.latest_telemetry().unwrap();
    assert_eq!(telemetry.ts, 20 * DEFAULT_TICK_INTERVAL_MS);
    assert!(telemetry.system_soc_pct > 0.0);
    assert!(telemetry.system_soh_pct > 90.0);
    assert!(store.frame_rows() > 0);
}
