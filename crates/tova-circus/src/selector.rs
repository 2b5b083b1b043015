//! Weighted, subnet-diverse path selection
//!
//! Guards are sampled by bandwidth, boosted by how many leading address bits
//! they share with this vantage point. Exits are drawn uniformly, and an exit
//! is only used if its subnet is not already held by another circuit.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tova_core::{Fingerprint, RelayDescriptor, Subnet};
use tracing::debug;

/// A two-hop path chosen for a new circuit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitPath {
    pub guard: Fingerprint,
    pub exit: Fingerprint,
    /// Subnet of the exit, reserved for this path
    pub exit_subnet: Subnet,
}

impl CircuitPath {
    pub fn hops(&self) -> Vec<Fingerprint> {
        vec![self.guard.clone(), self.exit.clone()]
    }
}

/// Length of the common leading-bit prefix of two addresses, floored at 1
pub fn prefix_overlap(a: Ipv4Addr, b: Ipv4Addr) -> u32 {
    let common = (u32::from(a) ^ u32::from(b)).leading_zeros();
    common.max(1)
}

/// Sampling weight of each guard
pub fn guard_weights(guards: &[RelayDescriptor], vantage: Option<Ipv4Addr>) -> Vec<u64> {
    guards
        .iter()
        .map(|guard| match vantage {
            Some(ip) => guard.bandwidth * u64::from(prefix_overlap(ip, guard.address)),
            None => guard.bandwidth,
        })
        .collect()
}

/// Choose up to `n` (guard, exit) paths
///
/// Every exit is considered at most once. Chosen exit subnets are added to
/// `in_use`, so no two returned paths (and no path and an existing circuit)
/// share a subnet.
pub fn select_paths<R: Rng + ?Sized>(
    guards: &[RelayDescriptor],
    exits: &[RelayDescriptor],
    n: usize,
    prefix_len: u8,
    vantage: Option<Ipv4Addr>,
    in_use: &mut HashSet<Subnet>,
    rng: &mut R,
) -> Vec<CircuitPath> {
    let mut paths = Vec::new();
    if guards.is_empty() {
        debug!("No guards available, cannot select paths");
        return paths;
    }

    let weighted = WeightedIndex::new(guard_weights(guards, vantage)).ok();
    let mut candidates: Vec<&RelayDescriptor> = exits.iter().collect();

    while paths.len() < n && !candidates.is_empty() {
        let exit = candidates.swap_remove(rng.gen_range(0..candidates.len()));
        let subnet = Subnet::of(exit.address, prefix_len);
        if !in_use.insert(subnet) {
            continue;
        }

        // All-zero weights fall back to a uniform draw
        let guard_idx = match &weighted {
            Some(dist) => dist.sample(rng),
            None => rng.gen_range(0..guards.len()),
        };
        paths.push(CircuitPath {
            guard: guards[guard_idx].fingerprint.clone(),
            exit: exit.fingerprint.clone(),
            exit_subnet: subnet,
        });
    }

    debug!("Selected {} of {} requested paths", paths.len(), n);
    paths
}
