//! Process-wide registry of local ports held by live connections.
//!
//! A [`PortRegistry`] is created once and shared (behind an `Arc`) by every
//! [`crate::connection::Connection`] in the process.  Listening connections
//! [`claim`](PortRegistry::claim) a known port; `accept()` mints a fresh one
//! with [`allocate`](PortRegistry::allocate).
//!
//! Allocation probes random ports until a free one turns up rather than
//! handing out a monotonically increasing counter, so churn does not walk the
//! counter off the end of the range.  Worst-case probing is unbounded under
//! high occupancy; the only hard failure is a completely full range.
//!
//! Ports are never released: entries stay in the registry for the life of the
//! process.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;
use thiserror::Error;

/// Ports handed out by [`PortRegistry::allocate`].
pub const PORT_RANGE: Range<u16> = 1..64_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} is already in use")]
    InUse(u16),
    #[error("all {0} allocatable ports are in use")]
    Exhausted(usize),
}

/// Set of occupied local ports guarded by a single lock.
#[derive(Debug, Default)]
pub struct PortRegistry {
    in_use: Mutex<HashSet<u16>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a specific port.  Fails if another connection already holds it.
    pub fn claim(&self, port: u16) -> Result<(), PortError> {
        if self.lock().insert(port) {
            log::debug!("[ports] claimed {port}");
            Ok(())
        } else {
            Err(PortError::InUse(port))
        }
    }

    /// Pick a free port from [`PORT_RANGE`] and reserve it.
    pub fn allocate(&self) -> Result<u16, PortError> {
        self.allocate_with(&mut rand::thread_rng())
    }

    /// Like [`allocate`](Self::allocate) but draws candidates from `rng`, so
    /// tests can make the probe sequence reproducible.
    pub fn allocate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<u16, PortError> {
        let capacity = PORT_RANGE.len();
        // Check-and-insert must happen under one guard.
        let mut in_use = self.lock();
        let occupied = in_use.iter().filter(|p| PORT_RANGE.contains(*p)).count();
        if occupied >= capacity {
            return Err(PortError::Exhausted(capacity));
        }

        let mut probes = 0u32;
        loop {
            probes += 1;
            let candidate = rng.gen_range(PORT_RANGE);
            if in_use.insert(candidate) {
                log::debug!("[ports] allocated {candidate} after {probes} probe(s)");
                return Ok(candidate);
            }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Number of ports currently held.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        // A panic while holding the guard cannot leave the set half-updated.
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    #[test]
    fn claim_twice_fails() {
        let reg = PortRegistry::new();
        reg.claim(5000).unwrap();
        assert_eq!(reg.claim(5000), Err(PortError::InUse(5000)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn allocate_avoids_claimed_ports() {
        let reg = PortRegistry::new();
        let mut rng = StdRng::seed_from_u64(7);
        // Find out which port this seed picks first, then block it.
        let first = PortRegistry::new().allocate_with(&mut rng.clone()).unwrap();
        reg.claim(first).unwrap();

        let port = reg.allocate_with(&mut rng).unwrap();
        assert_ne!(port, first);
        assert!(PORT_RANGE.contains(&port));
        assert!(reg.contains(port));
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let reg = Arc::new(PortRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    (0..250).map(|_| reg.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "a port was handed out twice");
        assert_eq!(reg.len(), total);
    }

    #[test]
    fn full_range_reports_exhaustion() {
        let reg = PortRegistry::new();
        for port in PORT_RANGE {
            reg.claim(port).unwrap();
        }
        assert_eq!(reg.allocate(), Err(PortError::Exhausted(PORT_RANGE.len())));
    }

    #[test]
    fn last_free_port_is_found() {
        let reg = PortRegistry::new();
        let free = 31_337;
        for port in PORT_RANGE.filter(|p| *p != free) {
            reg.claim(port).unwrap();
        }
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(reg.allocate_with(&mut rng), Ok(free));
    }

    #[test]
    fn ports_outside_range_do_not_count_towards_exhaustion() {
        let reg = PortRegistry::new();
        reg.claim(0).unwrap();
        reg.claim(65_000).unwrap();
        assert!(reg.allocate().is_ok());
    }
}
