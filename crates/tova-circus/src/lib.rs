//! # tova-circus
//!
//! Maintains the pool of pre-built overlay circuits that validation sessions
//! draw their vantage points from.
//!
//! This crate provides:
//! - Relay catalog: guard and exit classification of the consensus
//! - Path selection: bandwidth-weighted guards, one exit subnet per circuit
//! - Circuit pool: bootstrap, periodic renewal and expiry
//! - Vantage-IP discovery for the guard prefix boost

mod catalog;
mod pool;
mod selector;
mod vantage;

pub use catalog::{classify, fetch_relays, RelayCatalog, FETCH_ATTEMPTS, FETCH_BACKOFF};
pub use pool::{compute_expired, plan_builds, CircuitPool, PoolConfig, PoolRecord, TickReport};
pub use selector::{guard_weights, prefix_overlap, select_paths, CircuitPath};
pub use vantage::{discover_vantage_ip, DISCOVERY_URL};
