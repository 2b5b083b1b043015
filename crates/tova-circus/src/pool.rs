//! Circuit pool manager
//!
//! Keeps `n_circuits` pre-built circuits alive. Every tick the pool counts
//! BUILT circuits, expires registry entries past their TTL (or no longer
//! built), tops the pool back up and closes expired circuits that carry no
//! open stream.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tova_control::{circuits_with_open_streams, ControlLink};
use tova_core::fail_open::fail_open;
use tova_core::{
    unix_now, Circuit, CircuitId, ControlError, RecordSink, Result, Subnet, TovaConfig,
};
use tova_registry::CircuitRegistry;
use tracing::{debug, error, info, warn};

use crate::catalog::RelayCatalog;
use crate::selector::{select_paths, CircuitPath};

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of BUILT circuits
    pub n_circuits: usize,
    /// Circuits requested per bootstrap batch
    pub batch_size: usize,
    /// Seconds a circuit may live
    pub circuit_ttl: u64,
    /// Exit diversity block length
    pub prefix_len: u8,
    /// Tick period, also the pause between bootstrap batches
    pub build_interval: Duration,
    /// Pause between consensus polls while waiting for the first relays
    pub relay_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_circuits: 12,
            batch_size: 3,
            circuit_ttl: 600,
            prefix_len: 16,
            build_interval: Duration::from_secs(10),
            relay_wait: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    pub fn from_config(config: &TovaConfig) -> Self {
        Self {
            n_circuits: config.n_circuits,
            batch_size: config.val_k,
            circuit_ttl: config.circuit_ttl,
            prefix_len: config.prefix_len,
            build_interval: config.build_interval(),
            ..Self::default()
        }
    }
}

/// Structured pool events, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PoolRecord {
    VantageIp {
        ip: Option<Ipv4Addr>,
    },
    Tick {
        active: usize,
        expired: usize,
        to_build: usize,
    },
    Bootstrap {
        to_build: usize,
    },
    Relays {
        guards: usize,
        exits: usize,
    },
    Closed {
        closed: usize,
    },
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub active: usize,
    pub expired: usize,
    pub to_build: usize,
    /// Build requests the link accepted
    pub built: usize,
    pub closed: usize,
}

/// Number of circuits to request this tick, `clamp(n - active + expired, 0, n)`
pub fn plan_builds(n: usize, active: usize, expired: usize) -> usize {
    (n + expired).saturating_sub(active).min(n)
}

/// Registry entries past their TTL or no longer among the BUILT circuits
pub fn compute_expired(
    entries: &[(CircuitId, f64)],
    active: &HashSet<CircuitId>,
    ttl_secs: u64,
    now: f64,
) -> Vec<CircuitId> {
    entries
        .iter()
        .filter(|(id, created)| *created + (ttl_secs as f64) < now || !active.contains(id))
        .map(|(id, _)| id.clone())
        .collect()
}

/// The pool manager's context: control link, registry, relay catalog and
/// the exit subnet held by each circuit it built
pub struct CircuitPool<C: ControlLink, R: CircuitRegistry> {
    link: C,
    registry: R,
    config: PoolConfig,
    catalog: RelayCatalog,
    held: HashMap<CircuitId, Subnet>,
    vantage_ip: Option<Ipv4Addr>,
    sink: RecordSink,
    rng: StdRng,
}

impl<C: ControlLink, R: CircuitRegistry> CircuitPool<C, R> {
    pub fn new(link: C, registry: R, config: PoolConfig, sink: RecordSink) -> Self {
        Self {
            link,
            registry,
            config,
            catalog: RelayCatalog::new(),
            held: HashMap::new(),
            vantage_ip: None,
            sink,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_vantage_ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.vantage_ip = ip;
        self
    }

    pub fn with_catalog(mut self, catalog: RelayCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Deterministic path selection
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn catalog(&self) -> &RelayCatalog {
        &self.catalog
    }

    /// Exit subnets currently held by this pool's circuits
    pub fn held_subnets(&self) -> HashSet<Subnet> {
        self.held.values().copied().collect()
    }

    pub fn held_subnet(&self, id: &str) -> Option<Subnet> {
        self.held.get(id).copied()
    }

    /// Log the vantage IP the guard weighting uses
    pub async fn record_vantage_ip(&self) {
        self.sink
            .emit(&PoolRecord::VantageIp {
                ip: self.vantage_ip,
            })
            .await;
    }

    /// One maintenance pass
    pub async fn tick(&mut self) -> Result<TickReport> {
        let circuits = self.link.list_circuits().await?;
        let active: HashSet<CircuitId> = circuits
            .iter()
            .filter(|c| c.is_built())
            .map(|c| c.id.clone())
            .collect();
        let entries = self.registry.entries().await?;
        self.forget_untracked(&circuits, &entries);

        let expired = compute_expired(&entries, &active, self.config.circuit_ttl, unix_now());
        let to_build = plan_builds(self.config.n_circuits, active.len(), expired.len());
        self.sink
            .emit(&PoolRecord::Tick {
                active: active.len(),
                expired: expired.len(),
                to_build,
            })
            .await;

        let mut report = TickReport {
            active: active.len(),
            expired: expired.len(),
            to_build,
            ..TickReport::default()
        };

        if to_build > 0 {
            self.catalog.refresh(&self.link).await;
            self.record_relays().await;
            report.built = self.build_circuits(to_build).await;
        }

        if !expired.is_empty() {
            report.closed = self.expire_circuits(&expired).await?;
            self.sink
                .emit(&PoolRecord::Closed {
                    closed: report.closed,
                })
                .await;
        }

        debug!(?report, "Tick complete");
        Ok(report)
    }

    /// Select up to `n` diverse paths from the catalog and request them;
    /// returns how many requests were accepted
    pub async fn build_circuits(&mut self, n: usize) -> usize {
        let mut in_use = self.held_subnets();
        let paths = select_paths(
            self.catalog.guards(),
            self.catalog.exits(),
            n,
            self.config.prefix_len,
            self.vantage_ip,
            &mut in_use,
            &mut self.rng,
        );

        let mut built = 0;
        for path in &paths {
            if self.build_circuit(path).await.is_some() {
                built += 1;
            }
        }
        built
    }

    /// Request one circuit without waiting for it to finish building
    ///
    /// Only an accepted request is recorded in the registry and holds its
    /// exit subnet.
    pub async fn build_circuit(&mut self, path: &CircuitPath) -> Option<CircuitId> {
        match self.link.build_circuit(&path.hops()).await {
            Ok(id) => {
                fail_open("registry::set", || self.registry.set(&id, unix_now())).await;
                self.held.insert(id.clone(), path.exit_subnet);
                debug!("Requested circuit {} via exit {}", id, path.exit);
                Some(id)
            }
            Err(e) => {
                debug!("Build via exit {} rejected: {}", path.exit, e);
                None
            }
        }
    }

    /// Close expired circuits that carry no open stream; returns how many
    /// were closed
    pub async fn expire_circuits(&mut self, expired: &[CircuitId]) -> Result<usize> {
        let mut closed = 0;
        for id in expired {
            if circuits_with_open_streams(&self.link).await?.contains(id) {
                debug!("Circuit {} still carries a stream, keeping it", id);
                continue;
            }

            match self.link.close_circuit(id).await {
                Ok(()) => {}
                Err(ControlError::InvalidArguments(_)) => {
                    debug!("Circuit {} already gone", id);
                }
                Err(e) => {
                    warn!("Failed to close circuit {}: {}", id, e);
                    continue;
                }
            }

            if let Some(subnet) = self.held.remove(id) {
                debug!("Released exit subnet {}", subnet);
            }
            fail_open("registry::delete", || self.registry.delete(id)).await;
            closed += 1;
        }
        Ok(closed)
    }

    /// Wait for the first usable consensus, then build the pool in batches
    pub async fn bootstrap(&mut self) {
        info!("Bootstrapping pool of {} circuits", self.config.n_circuits);
        self.sink
            .emit(&PoolRecord::Bootstrap {
                to_build: self.config.n_circuits,
            })
            .await;

        loop {
            self.catalog.refresh(&self.link).await;
            if !self.catalog.is_empty() {
                break;
            }
            debug!("No relays yet, retrying in {:?}", self.config.relay_wait);
            sleep(self.config.relay_wait).await;
        }
        self.record_relays().await;

        let mut remaining = self.config.n_circuits;
        while remaining > 0 {
            let batch = remaining.min(self.config.batch_size.max(1));
            let built = self.build_circuits(batch).await;
            debug!("Bootstrap batch: {}/{} requested", built, batch);
            remaining -= batch;
            sleep(self.config.build_interval).await;
        }
    }

    /// Bootstrap, then tick every `build_interval` until `shutdown` resolves
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested during bootstrap");
                return;
            }
            _ = self.bootstrap() => {}
        }

        let mut ticker = interval(self.config.build_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Circuit pool stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Pool tick failed: {}", e);
                    }
                }
            }
        }
    }

    async fn record_relays(&self) {
        self.sink
            .emit(&PoolRecord::Relays {
                guards: self.catalog.guards().len(),
                exits: self.catalog.exits().len(),
            })
            .await;
    }

    /// Drop subnet holds of circuits neither the link nor the registry knows
    fn forget_untracked(&mut self, circuits: &[Circuit], entries: &[(CircuitId, f64)]) {
        let known: HashSet<&str> = circuits
            .iter()
            .map(|c| c.id.as_str())
            .chain(entries.iter().map(|(id, _)| id.as_str()))
            .collect();
        self.held.retain(|id, subnet| {
            let keep = known.contains(id.as_str());
            if !keep {
                debug!("Circuit {} vanished, releasing {}", id, subnet);
            }
            keep
        });
    }
}
