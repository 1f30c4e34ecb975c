//! In-memory lossy network for deterministic testing.
//!
//! Real networks drop, duplicate and corrupt packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Network`] connects any number of [`SimHost`]s (one per IPv4 address)
//! and applies a configurable fault model to every packet:
//!
//! | Fault       | Description                                               |
//! |-------------|-----------------------------------------------------------|
//! | Fault rules | Drop exactly the next *k* packets matching a predicate.   |
//! | Loss        | Drop a packet with probability `loss_rate`.               |
//! | Corruption  | Flip one bit with probability `corrupt_rate`; the         |
//! |             | receiver's checksum rejects it.                           |
//! | Duplication | Deliver a packet twice with probability `duplicate_rate`. |
//!
//! Packets travel through [`Packet::encode`] / [`Packet::decode`] exactly as
//! on a real wire.  Random faults draw from a seeded RNG so failures are
//! reproducible.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::Packet;
use crate::transport::{Demux, Transport, TransportError};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given packet is silently dropped.
    pub loss_rate: f64,
    /// Probability that a packet is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a packet has one bit flipped in flight.
    pub corrupt_rate: f64,
    /// Seed for the fault RNG.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0x5eed,
        }
    }
}

/// Counters describing what the network did with the traffic it carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub sent: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub duplicated: u64,
    pub delivered: u64,
}

type Filter = Box<dyn Fn(&Packet) -> bool + Send + Sync>;

/// Deterministic fault: drop the next `remaining` packets matching `filter`.
struct FaultRule {
    filter: Filter,
    remaining: usize,
}

/// The shared medium.  Create one, then [`attach`](Network::attach) hosts.
pub struct Network {
    config: SimulatorConfig,
    hosts: RwLock<HashMap<Ipv4Addr, Arc<Demux>>>,
    faults: Mutex<Faults>,
}

struct Faults {
    rng: StdRng,
    rules: Vec<FaultRule>,
    stats: NetStats,
}

impl Network {
    pub fn new(config: SimulatorConfig) -> Arc<Self> {
        let rng = StdRng::seed_from_u64(config.seed);
        Arc::new(Self {
            config,
            hosts: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults {
                rng,
                rules: Vec::new(),
                stats: NetStats::default(),
            }),
        })
    }

    /// A fault-free network.
    pub fn reliable() -> Arc<Self> {
        Self::new(SimulatorConfig::default())
    }

    /// Plug a host with address `ip` into the network.
    ///
    /// Attaching the same address twice returns hosts sharing one demux.
    pub fn attach(self: &Arc<Self>, ip: Ipv4Addr) -> Arc<SimHost> {
        let demux = {
            let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(hosts.entry(ip).or_insert_with(|| Arc::new(Demux::new())))
        };
        Arc::new(SimHost {
            ip,
            demux,
            network: Arc::clone(self),
        })
    }

    /// Drop the next `count` packets for which `filter` returns `true`.
    ///
    /// Rules are consulted in the order they were added; a packet consumes at
    /// most one rule.
    pub fn drop_next<F>(&self, count: usize, filter: F)
    where
        F: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        self.faults().rules.push(FaultRule {
            filter: Box::new(filter),
            remaining: count,
        });
    }

    pub fn stats(&self) -> NetStats {
        self.faults().stats
    }

    /// Carry one packet across the medium.
    fn transmit(&self, packet: &Packet) -> Result<(), TransportError> {
        let mut bytes = packet.encode()?;

        let copies = {
            let mut faults = self.faults();
            faults.stats.sent += 1;

            if faults.consume_rule(packet) {
                faults.stats.dropped += 1;
                log::debug!("[sim] rule dropped {packet}");
                return Ok(());
            }
            if faults.rng.gen_bool(self.config.loss_rate) {
                faults.stats.dropped += 1;
                log::debug!("[sim] lost {packet}");
                return Ok(());
            }
            if faults.rng.gen_bool(self.config.corrupt_rate) {
                let bit = faults.rng.gen_range(0..bytes.len() * 8);
                bytes[bit / 8] ^= 1 << (bit % 8);
                faults.stats.corrupted += 1;
            }
            if faults.rng.gen_bool(self.config.duplicate_rate) {
                faults.stats.duplicated += 1;
                2
            } else {
                1
            }
        };

        let decoded = match Packet::decode(&bytes) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[sim] receiver discarded damaged {packet}: {e}");
                return Ok(());
            }
        };

        let demux = {
            let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
            hosts.get(decoded.dst.ip()).cloned()
        };
        let Some(demux) = demux else {
            log::debug!("[sim] no host at {}, dropping {decoded}", decoded.dst.ip());
            return Ok(());
        };

        for _ in 0..copies {
            if demux.deliver(decoded.clone()) {
                self.faults().stats.delivered += 1;
            }
        }
        Ok(())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Faults {
    fn consume_rule(&mut self, packet: &Packet) -> bool {
        let hit = self
            .rules
            .iter_mut()
            .find(|rule| rule.remaining > 0 && (rule.filter)(packet));
        match hit {
            Some(rule) => {
                rule.remaining -= 1;
                true
            }
            None => false,
        }
    }
}

/// One address on a [`Network`]; implements [`Transport`].
pub struct SimHost {
    ip: Ipv4Addr,
    demux: Arc<Demux>,
    network: Arc<Network>,
}

impl SimHost {
    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }
}

impl Transport for SimHost {
    fn local_ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn demux(&self) -> &Demux {
        &self.demux
    }

    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        self.network.transmit(packet)
    }
}
