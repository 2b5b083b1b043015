//! # tova-registry
//!
//! The circuit registry maps circuit id → creation time (unix seconds) and is
//! the only state shared between the pool manager and validation workers.
//!
//! Consistency contract:
//! - Per-key operations are atomic; there are no multi-key transactions
//! - Last writer wins per key
//! - The pool manager is the only deleter; workers only insert missing keys

mod file;
mod memory;

pub use file::FileRegistry;
pub use memory::MemoryRegistry;

use async_trait::async_trait;
use tova_core::{CircuitId, Result};

/// Shared circuit-id → creation-time store
#[async_trait]
pub trait CircuitRegistry: Send + Sync {
    /// Creation time of `id`, if registered
    async fn get(&self, id: &str) -> Result<Option<f64>>;

    /// Record `id`, replacing any previous value
    async fn set(&self, id: &str, created: f64) -> Result<()>;

    /// Record `id` unless it is already present; returns whether it was inserted
    async fn insert_if_absent(&self, id: &str, created: f64) -> Result<bool>;

    /// Remove `id`; removing a missing key is not an error
    async fn delete(&self, id: &str) -> Result<()>;

    /// Snapshot of all entries
    async fn entries(&self) -> Result<Vec<(CircuitId, f64)>>;
}

/// Whether a circuit created at `created` is still inside its TTL at `now`
pub fn within_ttl(created: f64, ttl_secs: u64, now: f64) -> bool {
    created + ttl_secs as f64 > now
}
