//! Plant communication topology: the fixed device graph, per-link latency
//! profiles, and the tick exchange schedule.
//!
//! One tick always issues the same traffic, in the same order: internal
//! battery→BMS pushes, CCU report/command pairs, front-end register polls,
//! PCS station-bus reports, the aggregate EMS report, and the telecontrol
//! uplink. Reports are built from what the handlers cached, so impairment on
//! the poll links degrades everything downstream of them.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::bus::{FrameRecord, LinkDef, SendRequest, VirtualBus};
use crate::devices::{
    BatteryRack, BmsDevice, CcuDevice, DeviceKey, DeviceKind, DeviceRegistry, EmsGateway,
    FrontEndServer, InternalSample, PcsDevice, RemoteMaster, UnitStatuses, UnitTelemetry,
    REGISTER_BANK_WORDS,
};
use crate::protocol::{modbus, station_bus, telecontrol, CommStatus, Direction, LinkProtocol};

const TELECONTROL_SOC_IOA: u32 = 1001;

/// Units reported individually in the EMS aggregate; larger plants aggregate
/// the remainder into the station totals only.
const EMS_REPORT_UNIT_CAP: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub unit_count: u8,
    pub ccu_count: u8,
    pub drop_rate: f64,
    pub corrupt_rate: f64,
    pub seed: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            unit_count: 10,
            ccu_count: 3,
            drop_rate: 0.0,
            corrupt_rate: 0.0,
            seed: crate::bus::DEFAULT_RNG_SEED,
        }
    }
}

/// Ground-truth feed for one unit, refreshed by the plant model before each
/// tick.
#[derive(Debug, Clone, Copy)]
pub struct SourceUnit {
    pub telemetry: UnitTelemetry,
    pub unit_status: CommStatus,
    pub bms_status: CommStatus,
}

pub struct TopologySimulator {
    cfg: TopologyConfig,
    bus: VirtualBus,
    devices: DeviceRegistry,
    source: BTreeMap<u8, SourceUnit>,
    tx_id: u16,
}

impl TopologySimulator {
    pub fn new(mut cfg: TopologyConfig) -> Self {
        // A station always carries at least one supervisory CCU; the unit
        // round-robin assignment divides by this count.
        cfg.ccu_count = cfg.ccu_count.max(1);
        let mut sim = Self {
            cfg,
            bus: VirtualBus::with_seed(cfg.seed),
            devices: DeviceRegistry::new(),
            source: BTreeMap::new(),
            tx_id: 1,
        };
        sim.register_links();
        sim.register_devices();
        sim
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.cfg
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkDef> {
        self.bus.links()
    }

    pub fn set_impairment(&mut self, drop_rate: f64, corrupt_rate: f64) {
        self.cfg.drop_rate = drop_rate;
        self.cfg.corrupt_rate = corrupt_rate;
        self.bus.set_impairment(drop_rate, corrupt_rate);
    }

    /// What the front-end last decoded from the register polls.
    pub fn poll_cache(&self) -> &BTreeMap<u8, UnitTelemetry> {
        &self.devices.points.bms_latest
    }

    /// Replaces the ground-truth feed for the next tick.
    pub fn set_sources(&mut self, sources: BTreeMap<u8, SourceUnit>) {
        self.devices.points.unit_statuses.clear();
        for (id, src) in &sources {
            self.devices.points.unit_statuses.insert(
                *id,
                UnitStatuses {
                    unit: Some(src.unit_status),
                    bms: Some(src.bms_status),
                },
            );
        }
        self.source = sources;
    }

    fn next_tx_id(&mut self) -> u16 {
        self.tx_id = self.tx_id.wrapping_add(1);
        self.tx_id
    }

    /// Runs one full exchange schedule and returns every frame record it
    /// produced.
    pub fn tick(&mut self, ts: u64) -> Vec<FrameRecord> {
        let mut frames = Vec::new();
        let front_end = DeviceKey::new(DeviceKind::FrontEnd, 1);

        // 0) battery racks push internal samples to their BMS
        for i in 1..=self.cfg.unit_count {
            let Some(src) = self.source.get(&i).copied() else {
                continue;
            };
            let sample = InternalSample {
                telemetry: src.telemetry,
            };
            let Ok(payload) = serde_json::to_vec(&sample) else {
                continue;
            };
            let battery = DeviceKey::new(DeviceKind::Battery, i);
            let bms = DeviceKey::new(DeviceKind::Bms, i);
            let t = src.telemetry;
            self.bus.send(
                SendRequest {
                    link_key: LinkDef::link_key(LinkProtocol::InternalBus, battery, bms),
                    protocol: LinkProtocol::InternalBus,
                    from: battery,
                    to: bms,
                    direction: Direction::Uplink,
                    payload,
                    summary: format!(
                        "internal sample voltage={} current={} soc={}",
                        t.voltage_v, t.current_a, t.soc_pct
                    ),
                },
                ts,
                &mut self.devices,
                &mut frames,
            );
        }

        // CCU report uplink, then the front-end heartbeat command back down
        for i in 1..=self.cfg.ccu_count {
            let ccu = DeviceKey::new(DeviceKind::Ccu, i);
            let link_key = LinkDef::link_key(LinkProtocol::Iec61850, ccu, front_end);
            let report = self.build_ccu_report(i, ts);
            if let Ok(payload) = station_bus::encode_message(&report) {
                self.bus.send(
                    SendRequest {
                        link_key: link_key.clone(),
                        protocol: LinkProtocol::Iec61850,
                        from: ccu,
                        to: front_end,
                        direction: Direction::Uplink,
                        payload,
                        summary: format!("CCU report CCU{i} entries={}", report.entries.len()),
                    },
                    ts,
                    &mut self.devices,
                    &mut frames,
                );
            }
            let command = build_ccu_command(i, ts);
            if let Ok(payload) = station_bus::encode_message(&command) {
                self.bus.send(
                    SendRequest {
                        link_key,
                        protocol: LinkProtocol::Iec61850,
                        from: front_end,
                        to: ccu,
                        direction: Direction::Downlink,
                        payload,
                        summary: format!("CCU cmd CCU{i} entries={}", command.entries.len()),
                    },
                    ts,
                    &mut self.devices,
                    &mut frames,
                );
            }
        }

        // front-end polls each BMS register bank
        for i in 1..=self.cfg.unit_count {
            let transaction_id = self.next_tx_id();
            let bms = DeviceKey::new(DeviceKind::Bms, i);
            let payload = modbus::encode_read_request(&modbus::ReadRequest {
                transaction_id,
                unit_id: i,
                start: 0,
                quantity: REGISTER_BANK_WORDS as u16,
            });
            self.bus.send(
                SendRequest {
                    link_key: LinkDef::link_key(LinkProtocol::ModbusTcp, bms, front_end),
                    protocol: LinkProtocol::ModbusTcp,
                    from: front_end,
                    to: bms,
                    direction: Direction::Downlink,
                    payload,
                    summary: format!("ReadHoldingRegs unit={i} start=0 qty={REGISTER_BANK_WORDS}"),
                },
                ts,
                &mut self.devices,
                &mut frames,
            );
        }

        // PCS station-bus reports
        for i in 1..=self.cfg.unit_count {
            let pcs = DeviceKey::new(DeviceKind::Pcs, i);
            let report = self.build_pcs_report(i, ts);
            if let Ok(payload) = station_bus::encode_message(&report) {
                self.bus.send(
                    SendRequest {
                        link_key: LinkDef::link_key(LinkProtocol::Iec61850, pcs, front_end),
                        protocol: LinkProtocol::Iec61850,
                        from: pcs,
                        to: front_end,
                        direction: Direction::Uplink,
                        payload,
                        summary: format!("PCS report PCS{i} entries={}", report.entries.len()),
                    },
                    ts,
                    &mut self.devices,
                    &mut frames,
                );
            }
        }

        // aggregate report to the EMS
        let ems = DeviceKey::new(DeviceKind::Ems, 1);
        let report = self.build_ems_report(ts);
        if let Ok(payload) = station_bus::encode_message(&report) {
            self.bus.send(
                SendRequest {
                    link_key: LinkDef::link_key(LinkProtocol::Iec61850, ems, front_end),
                    protocol: LinkProtocol::Iec61850,
                    from: front_end,
                    to: ems,
                    direction: Direction::Uplink,
                    payload,
                    summary: format!("EMS report {} entries={}", report.dataset, report.entries.len()),
                },
                ts,
                &mut self.devices,
                &mut frames,
            );
        }

        // cyclic measurand to the remote dispatch master
        let remote = DeviceKey::new(DeviceKind::Remote, 1);
        let frame = self.build_telecontrol_uplink();
        if let Ok(payload) = telecontrol::encode_frame(&frame) {
            self.bus.send(
                SendRequest {
                    link_key: LinkDef::link_key(LinkProtocol::Iec104, front_end, remote),
                    protocol: LinkProtocol::Iec104,
                    from: front_end,
                    to: remote,
                    direction: Direction::Uplink,
                    payload,
                    summary: format!("I-frame ioa={} value={}", frame.ioa, frame.value),
                },
                ts,
                &mut self.devices,
                &mut frames,
            );
        }

        frames
    }

    fn register_links(&mut self) {
        let front_end = DeviceKey::new(DeviceKind::FrontEnd, 1);
        let drop_rate = self.cfg.drop_rate;
        let corrupt_rate = self.cfg.corrupt_rate;
        let unit_count = self.cfg.unit_count;
        let ccu_count = self.cfg.ccu_count;
        let bus = &mut self.bus;
        let mut add = |protocol, a, b, min, max| {
            bus.register_link(LinkDef {
                key: LinkDef::link_key(protocol, a, b),
                protocol,
                endpoint_a: a,
                endpoint_b: b,
                drop_rate,
                corrupt_rate,
                latency_ms_min: min,
                latency_ms_max: max,
            });
        };
        for i in 1..=unit_count {
            let battery = DeviceKey::new(DeviceKind::Battery, i);
            let bms = DeviceKey::new(DeviceKind::Bms, i);
            let pcs = DeviceKey::new(DeviceKind::Pcs, i);
            add(LinkProtocol::InternalBus, battery, bms, 1, 8);
            add(LinkProtocol::ModbusTcp, bms, front_end, 6, 45);
            add(LinkProtocol::Iec61850, pcs, front_end, 3, 25);
        }
        for i in 1..=ccu_count {
            let ccu = DeviceKey::new(DeviceKind::Ccu, i);
            add(LinkProtocol::Iec61850, ccu, front_end, 3, 28);
        }
        add(
            LinkProtocol::Iec61850,
            DeviceKey::new(DeviceKind::Ems, 1),
            front_end,
            2,
            18,
        );
        add(
            LinkProtocol::Iec104,
            front_end,
            DeviceKey::new(DeviceKind::Remote, 1),
            18,
            120,
        );
    }

    fn register_devices(&mut self) {
        for i in 1..=self.cfg.unit_count {
            self.devices
                .register(DeviceKey::new(DeviceKind::Battery, i), alloc::boxed::Box::new(BatteryRack));
            self.devices
                .register(DeviceKey::new(DeviceKind::Bms, i), alloc::boxed::Box::new(BmsDevice::new(i)));
            self.devices
                .register(DeviceKey::new(DeviceKind::Pcs, i), alloc::boxed::Box::new(PcsDevice));
        }
        for i in 1..=self.cfg.ccu_count {
            self.devices
                .register(DeviceKey::new(DeviceKind::Ccu, i), alloc::boxed::Box::new(CcuDevice));
        }
        self.devices
            .register(DeviceKey::new(DeviceKind::FrontEnd, 1), alloc::boxed::Box::new(FrontEndServer));
        self.devices
            .register(DeviceKey::new(DeviceKind::Ems, 1), alloc::boxed::Box::new(EmsGateway));
        self.devices
            .register(DeviceKey::new(DeviceKind::Remote, 1), alloc::boxed::Box::new(RemoteMaster));
    }

    /// CCU uplink: per-status unit counts for the units this CCU supervises.
    fn build_ccu_report(&self, ccu_id: u8, ts: u64) -> station_bus::StationMessage {
        let mine = self
            .source
            .iter()
            .filter(|(gid, _)| ((**gid - 1) % self.cfg.ccu_count) + 1 == ccu_id)
            .map(|(_, src)| src.unit_status);
        let mut normal = 0u32;
        let mut warning = 0u32;
        let mut error = 0u32;
        for status in mine {
            match status {
                CommStatus::Normal => normal += 1,
                CommStatus::Warning => warning += 1,
                CommStatus::Error => error += 1,
            }
        }
        let entries = alloc::vec![
            station_bus::DatasetEntry::good(
                format!("CCU{ccu_id}/Groups/Normal"),
                normal.to_string(),
            ),
            station_bus::DatasetEntry {
                key: format!("CCU{ccu_id}/Groups/Warning"),
                value: warning.to_string(),
                quality: if warning > 0 {
                    station_bus::EntryQuality::Questionable
                } else {
                    station_bus::EntryQuality::Good
                },
            },
            station_bus::DatasetEntry {
                key: format!("CCU{ccu_id}/Groups/Error"),
                value: error.to_string(),
                quality: if error > 0 {
                    station_bus::EntryQuality::Invalid
                } else {
                    station_bus::EntryQuality::Good
                },
            },
        ];
        station_bus::StationMessage {
            service: station_bus::Service::Mms,
            direction: Direction::Uplink,
            dataset: format!("CCU{ccu_id}/Report@{ts}"),
            entries,
        }
    }

    /// PCS uplink: estimated power, SOC, and temperature from the freshest
    /// view of its unit (ground truth, falling back to the poll cache).
    fn build_pcs_report(&self, pcs_id: u8, ts: u64) -> station_bus::StationMessage {
        let base = self
            .source
            .get(&pcs_id)
            .map(|src| src.telemetry)
            .or_else(|| self.devices.points.bms_latest.get(&pcs_id).copied())
            .unwrap_or_default();
        let est_kw = round2(base.voltage_v * base.current_a / 1000.0);
        let entries = alloc::vec![
            station_bus::DatasetEntry::good(format!("PCS{pcs_id}/EstKw"), fmt_num(est_kw)),
            station_bus::DatasetEntry::good(format!("PCS{pcs_id}/Soc"), fmt_num(base.soc_pct)),
            station_bus::DatasetEntry::good(format!("PCS{pcs_id}/Temp"), fmt_num(base.temperature_c)),
        ];
        station_bus::StationMessage {
            service: station_bus::Service::Mms,
            direction: Direction::Uplink,
            dataset: format!("PCS{pcs_id}/Report@{ts}"),
            entries,
        }
    }

    /// Aggregate uplink to the EMS, built strictly from the poll cache.
    fn build_ems_report(&self, ts: u64) -> station_bus::StationMessage {
        let cache = &self.devices.points.bms_latest;
        let mut entries = Vec::new();
        let avg_soc = if cache.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let n = cache.len() as f64;
            round1(cache.values().map(|t| t.soc_pct).sum::<f64>() / n)
        };
        let station_kw = round2(
            cache
                .values()
                .map(|t| round1(t.voltage_v * t.current_a))
                .sum::<f64>()
                / 1000.0,
        );
        entries.push(station_bus::DatasetEntry::good(
            "Station/AvgSocPct",
            fmt_num(avg_soc),
        ));
        entries.push(station_bus::DatasetEntry::good(
            "Station/EstPowerMw",
            fmt_num(station_kw),
        ));
        for (id, t) in cache.iter().take(EMS_REPORT_UNIT_CAP) {
            entries.push(station_bus::DatasetEntry::good(
                format!("BMS{id}/Voltage"),
                fmt_num(t.voltage_v),
            ));
            entries.push(station_bus::DatasetEntry::good(
                format!("BMS{id}/Current"),
                fmt_num(t.current_a),
            ));
            entries.push(station_bus::DatasetEntry::good(
                format!("BMS{id}/Soc"),
                fmt_num(t.soc_pct),
            ));
        }
        station_bus::StationMessage {
            service: station_bus::Service::Mms,
            direction: Direction::Uplink,
            dataset: format!("FS1/EMS_Report@{ts}"),
            entries,
        }
    }

    /// Cyclic average-SOC measurand for the dispatch centre.
    fn build_telecontrol_uplink(&self) -> telecontrol::InfoFrame {
        let cache = &self.devices.points.bms_latest;
        let avg_soc = if cache.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let n = cache.len() as f64;
            round1(cache.values().map(|t| t.soc_pct).sum::<f64>() / n)
        };
        telecontrol::InfoFrame::cyclic_measurand(TELECONTROL_SOC_IOA, fmt_num(avg_soc))
    }
}

impl core::fmt::Debug for TopologySimulator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TopologySimulator")
            .field("cfg", &self.cfg)
            .field("tx_id", &self.tx_id)
            .finish_non_exhaustive()
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn fmt_num(v: f64) -> String {
    v.to_string()
}

/// Heartbeat command the front-end answers a CCU report with.
fn build_ccu_command(ccu_id: u8, ts: u64) -> station_bus::StationMessage {
    station_bus::StationMessage {
        service: station_bus::Service::Mms,
        direction: Direction::Downlink,
        dataset: format!("FS1/CCU{ccu_id}_Cmd@{ts}"),
        entries: alloc::vec![station_bus::DatasetEntry::good(
            format!("CCU{ccu_id}/Cmd/Heartbeat"),
            ts.to_string(),
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ChargeState;

    fn sources(n: u8) -> BTreeMap<u8, SourceUnit> {
        let mut map = BTreeMap::new();
        for i in 1..=n {
            map.insert(
                i,
                SourceUnit {
                    telemetry: UnitTelemetry {
                        voltage_v: 750.0,
                        current_a: 120.0,
                        temperature_c: 30.0,
                        soc_pct: 60.0,
                        soh: 0.97,
                        power_w: 90_000.0,
                        charging: ChargeState::Charging,
                    },
                    unit_status: CommStatus::Normal,
                    bms_status: CommStatus::Normal,
                },
            );
        }
        map
    }

    fn clean_config(units: u8) -> TopologyConfig {
        TopologyConfig {
            unit_count: units,
            ccu_count: 3,
            drop_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 42,
        }
    }

    #[test]
    fn test_tick_without_impairment_has_no_errors() {
        let mut sim = TopologySimulator::new(clean_config(4));
        sim.set_sources(sources(4));
        let frames = sim.tick(1_000);
        assert!(!frames.is_empty());
        assert!(frames.iter().all(|f| f.ok));
        assert!(frames.iter().all(|f| f.error.is_none()));
    }

    #[test]
    fn test_poll_cache_fills_after_tick() {
        let mut sim = TopologySimulator::new(clean_config(5));
        sim.set_sources(sources(5));
        sim.tick(1_000);
        assert_eq!(sim.poll_cache().len(), 5);
        let t = sim.poll_cache()[&3];
        assert!((t.soc_pct - 60.0).abs() < 1e-9);
        assert_eq!(t.charging, ChargeState::Charging);
    }

    #[test]
    fn test_full_drop_never_reaches_handlers() {
        let mut sim = TopologySimulator::new(TopologyConfig {
            drop_rate: 1.0,
            ..clean_config(3)
        });
        sim.set_sources(sources(3));
        let frames = sim.tick(1_000);
        assert!(sim.poll_cache().is_empty());
        assert!(frames.iter().all(|f| !f.summary.starts_with("RX ")));
        assert!(frames
            .iter()
            .filter(|f| f.summary.starts_with("DROP "))
            .all(|f| f.error.as_deref() == Some("dropped")));
    }

    #[test]
    fn test_latency_within_link_bounds() {
        let mut sim = TopologySimulator::new(clean_config(6));
        sim.set_sources(sources(6));
        let frames = sim.tick(1_000);
        for frame in &frames {
            let link = sim.bus.link(&frame.link_key).unwrap();
            assert!(frame.latency_ms >= link.latency_ms_min);
            assert!(frame.latency_ms <= link.latency_ms_max);
        }
    }

    #[test]
    fn test_transaction_ids_advance_and_wrap() {
        let mut sim = TopologySimulator::new(clean_config(2));
        sim.tx_id = 0xFFFE;
        assert_eq!(sim.next_tx_id(), 0xFFFF);
        assert_eq!(sim.next_tx_id(), 0);
        assert_eq!(sim.next_tx_id(), 1);
    }

    #[test]
    fn test_ccu_report_flags_error_units() {
        let mut sim = TopologySimulator::new(clean_config(3));
        let mut src = sources(3);
        if let Some(unit) = src.get_mut(&1) {
            unit.unit_status = CommStatus::Error;
        }
        sim.set_sources(src);
        // Unit 1 maps onto CCU 1.
        let report = sim.build_ccu_report(1, 1_000);
        assert_eq!(report.entries[2].value, "1");
        assert_eq!(report.entries[2].quality, station_bus::EntryQuality::Invalid);
    }

    #[test]
    fn test_zero_ccu_count_normalizes_to_one() {
        let mut sim = TopologySimulator::new(TopologyConfig {
            ccu_count: 0,
            ..clean_config(4)
        });
        assert_eq!(sim.config().ccu_count, 1);
        sim.set_sources(sources(4));
        let frames = sim.tick(1_000);
        assert!(frames.iter().all(|f| f.error.is_none()));
        // Every unit lands on the single CCU.
        let report = sim.build_ccu_report(1, 2_000);
        assert_eq!(report.entries[0].value, "4");
    }

    #[test]
    fn test_ems_report_carries_station_aggregates() {
        let mut sim = TopologySimulator::new(clean_config(4));
        sim.set_sources(sources(4));
        sim.tick(1_000);
        let report = sim.build_ems_report(2_000);
        assert_eq!(report.entries[0].key, "Station/AvgSocPct");
        assert_eq!(report.entries[0].value, "60");
        // 2 station rows + 3 rows per polled unit
        assert_eq!(report.entries.len(), 2 + 3 * 4);
    }
}
