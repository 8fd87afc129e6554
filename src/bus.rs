//! Virtual communication bus: named point-to-point links with configurable
//! impairment (drop, corruption, latency) and a frame-record log of every
//! transfer attempt.
//!
//! A send produces a TX record, then either a DROP record, or an RX record at
//! the receiver. Synchronous replies from the receiver re-enter the same link
//! with endpoints swapped; the reply chain is bounded, never recursive.

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::devices::{DeviceKey, DeviceRegistry, InboundMessage, ReceiveOutcome};
use crate::protocol::{payload_hex, CommStatus, Direction, LinkProtocol};

pub(crate) const DEFAULT_RNG_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Longest request→reply chain a single send may produce. The deepest real
/// exchange is poll→response (2 hops).
const MAX_REPLY_HOPS: usize = 4;

const MAX_CORRUPT_BITS: usize = 3;

/// Linear congruential generator, fixed-seeded for reproducible runs.
#[derive(Debug, Clone)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_random(&mut self) -> u64 {
        // Numerical Recipes LCG constants
        self.state = self.state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.state
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn random_float(&mut self) -> f64 {
        (self.next_random() as f64) / (u64::MAX as f64)
    }

    /// Uniform pick from the inclusive range `[min, max]`.
    pub fn random_range(&mut self, min: u32, max: u32) -> u32 {
        if max <= min {
            return min;
        }
        let span = u64::from(max - min + 1);
        #[allow(clippy::cast_possible_truncation)]
        let offset = (self.next_random() % span) as u32;
        min + offset
    }

    pub fn random_index(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = (self.next_random() % len as u64) as usize;
        idx
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(DEFAULT_RNG_SEED)
    }
}

/// One registered link and its impairment profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDef {
    pub key: String,
    pub protocol: LinkProtocol,
    pub endpoint_a: DeviceKey,
    pub endpoint_b: DeviceKey,
    /// Probability in [0,1] that a transfer is lost before the receiver.
    pub drop_rate: f64,
    /// Probability in [0,1] that the delivered payload has bits flipped.
    pub corrupt_rate: f64,
    pub latency_ms_min: u32,
    pub latency_ms_max: u32,
}

impl LinkDef {
    pub fn link_key(protocol: LinkProtocol, a: DeviceKey, b: DeviceKey) -> String {
        format!("{protocol}-{a}-{b}")
    }
}

/// Immutable record of one transfer attempt. Three phases of the same send
/// (TX, DROP, RX) each append one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub ts: u64,
    pub link_key: String,
    pub protocol: LinkProtocol,
    pub direction: Direction,
    pub from: DeviceKey,
    pub to: DeviceKey,
    pub ok: bool,
    pub status: CommStatus,
    pub latency_ms: u32,
    pub bytes: usize,
    pub summary: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub error: Option<String>,
}

impl FrameRecord {
    pub fn payload_hex(&self) -> String {
        payload_hex(&self.payload)
    }

    /// True when this record touches the given device on either end.
    pub fn touches(&self, key: DeviceKey) -> bool {
        self.from == key || self.to == key
    }
}

/// Outbound transfer handed to [`VirtualBus::send`].
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub link_key: String,
    pub protocol: LinkProtocol,
    pub from: DeviceKey,
    pub to: DeviceKey,
    pub direction: Direction,
    pub payload: Vec<u8>,
    pub summary: String,
}

#[derive(Debug)]
pub struct VirtualBus {
    links: BTreeMap<String, LinkDef>,
    rng: SimRng,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_RNG_SEED)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            links: BTreeMap::new(),
            rng: SimRng::new(seed),
        }
    }

    pub fn register_link(&mut self, link: LinkDef) {
        self.links.insert(link.key.clone(), link);
    }

    pub fn link(&self, key: &str) -> Option<&LinkDef> {
        self.links.get(key)
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkDef> {
        self.links.values()
    }

    /// Applies a drop/corrupt profile to every registered link. Latency
    /// ranges are part of the topology and stay untouched.
    pub fn set_impairment(&mut self, drop_rate: f64, corrupt_rate: f64) {
        for link in self.links.values_mut() {
            link.drop_rate = drop_rate;
            link.corrupt_rate = corrupt_rate;
        }
    }

    /// Runs one transfer and any synchronous replies it provokes, appending
    /// every frame record to `out`.
    pub fn send(
        &mut self,
        request: SendRequest,
        ts: u64,
        devices: &mut DeviceRegistry,
        out: &mut Vec<FrameRecord>,
    ) {
        let mut pending = Some(request);
        let mut hops = 0;
        while let Some(req) = pending.take() {
            if hops >= MAX_REPLY_HOPS {
                debug_assert!(false, "reply chain exceeded {MAX_REPLY_HOPS} hops");
                break;
            }
            hops += 1;
            pending = self.transfer(req, ts, devices, out);
        }
    }

    /// One hop: TX, impairment, delivery. Returns the reply transfer when the
    /// receiver answered synchronously.
    fn transfer(
        &mut self,
        req: SendRequest,
        ts: u64,
        devices: &mut DeviceRegistry,
        out: &mut Vec<FrameRecord>,
    ) -> Option<SendRequest> {
        let Some(link) = self.links.get(&req.link_key).cloned() else {
            out.push(FrameRecord {
                ts,
                link_key: req.link_key.clone(),
                protocol: req.protocol,
                direction: req.direction,
                from: req.from,
                to: req.to,
                ok: false,
                status: CommStatus::Error,
                latency_ms: 0,
                bytes: req.payload.len(),
                summary: req.summary,
                payload: req.payload,
                error: Some("link_not_found".to_owned()),
            });
            return None;
        };

        let latency_ms = self.rng.random_range(link.latency_ms_min, link.latency_ms_max);

        out.push(FrameRecord {
            ts,
            link_key: link.key.clone(),
            protocol: req.protocol,
            direction: req.direction,
            from: req.from,
            to: req.to,
            ok: true,
            status: CommStatus::Normal,
            latency_ms,
            bytes: req.payload.len(),
            summary: format!("TX {}", req.summary),
            payload: req.payload.clone(),
            error: None,
        });

        if self.rng.random_float() < link.drop_rate {
            out.push(FrameRecord {
                ts,
                link_key: link.key.clone(),
                protocol: req.protocol,
                direction: req.direction,
                from: req.from,
                to: req.to,
                ok: false,
                status: CommStatus::Error,
                latency_ms,
                bytes: req.payload.len(),
                summary: format!("DROP {}", req.summary),
                payload: req.payload,
                error: Some("dropped".to_owned()),
            });
            return None;
        }

        if !devices.is_registered(req.to) {
            out.push(FrameRecord {
                ts,
                link_key: link.key.clone(),
                protocol: req.protocol,
                direction: req.direction,
                from: req.from,
                to: req.to,
                ok: false,
                status: CommStatus::Error,
                latency_ms,
                bytes: req.payload.len(),
                summary: format!("RX {}", req.summary),
                payload: req.payload,
                error: Some("target_unreachable".to_owned()),
            });
            return None;
        }

        let corrupted = self.rng.random_float() < link.corrupt_rate;
        let delivered = if corrupted {
            self.corrupt_payload(&req.payload)
        } else {
            req.payload.clone()
        };

        let msg = InboundMessage {
            ts,
            link_key: &link.key,
            protocol: req.protocol,
            from: req.from,
            to: req.to,
            direction: req.direction,
            payload: &delivered,
            latency_ms,
            corrupted,
        };
        // Registration was checked above.
        let outcome = devices
            .receive(&msg)
            .unwrap_or_else(|| ReceiveOutcome::rejected(CommStatus::Error, "target_unreachable"));

        out.push(FrameRecord {
            ts,
            link_key: link.key.clone(),
            protocol: req.protocol,
            direction: req.direction,
            from: req.from,
            to: req.to,
            ok: outcome.ok,
            status: outcome.status,
            latency_ms,
            bytes: delivered.len(),
            summary: format!("RX {}", req.summary),
            payload: delivered,
            error: outcome.error,
        });

        outcome.reply.map(|reply| SendRequest {
            link_key: link.key,
            protocol: req.protocol,
            from: req.to,
            to: req.from,
            direction: req.direction.flipped(),
            payload: reply.payload,
            summary: reply.summary,
        })
    }

    /// Flips between 1 and 3 random bits, fewer for tiny payloads.
    fn corrupt_payload(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut out = payload.to_vec();
        if out.is_empty() {
            return out;
        }
        let flips = core::cmp::max(1, core::cmp::min(MAX_CORRUPT_BITS, out.len() / 8));
        for _ in 0..flips {
            let at = self.rng.random_index(out.len());
            let bit = self.rng.random_index(8);
            out[at] ^= 1 << bit;
        }
        out
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceKind;

    #[test]
    fn test_rng_is_deterministic() {
        let mut a = SimRng::new(77);
        let mut b = SimRng::new(77);
        for _ in 0..32 {
            assert_eq!(a.next_random(), b.next_random());
        }
    }

    #[test]
    fn test_random_range_is_inclusive_and_bounded() {
        let mut rng = SimRng::default();
        let mut seen_min = false;
        let mut seen_max = false;
        for _ in 0..4096 {
            let v = rng.random_range(3, 7);
            assert!((3..=7).contains(&v));
            seen_min |= v == 3;
            seen_max |= v == 7;
        }
        assert!(seen_min && seen_max);
        assert_eq!(rng.random_range(9, 9), 9);
        assert_eq!(rng.random_range(9, 2), 9);
    }

    #[test]
    fn test_random_float_in_unit_interval() {
        let mut rng = SimRng::default();
        for _ in 0..1024 {
            let f = rng.random_float();
            assert!((0.0..=1.0).contains(&f));
        }
    }

    #[test]
    fn test_corruption_flip_count_scales_with_size() {
        let mut bus = VirtualBus::new();
        let small = bus.corrupt_payload(&[0u8; 4]);
        assert_eq!(small.iter().map(|b| b.count_ones()).sum::<u32>(), 1);
        let large = bus.corrupt_payload(&alloc::vec![0u8; 64]);
        let flipped: u32 = large.iter().map(|b| b.count_ones()).sum();
        // Up to 3 flips; fewer only if two flips land on the same bit.
        assert!(flipped >= 1 && flipped <= 3);
    }

    #[test]
    fn test_send_on_unknown_link_records_error() {
        let mut bus = VirtualBus::new();
        let mut devices = DeviceRegistry::new();
        let mut out = Vec::new();
        bus.send(
            SendRequest {
                link_key: String::from("nope"),
                protocol: LinkProtocol::InternalBus,
                from: DeviceKey::new(DeviceKind::Battery, 1),
                to: DeviceKey::new(DeviceKind::Bms, 1),
                direction: Direction::Uplink,
                payload: alloc::vec![1, 2, 3],
                summary: String::from("sample"),
            },
            10,
            &mut devices,
            &mut out,
        );
        assert_eq!(out.len(), 1);
        assert!(!out[0].ok);
        assert_eq!(out[0].latency_ms, 0);
        assert_eq!(out[0].error.as_deref(), Some("link_not_found"));
    }
}
