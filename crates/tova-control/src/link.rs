//! Control link abstraction

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tova_core::{Circuit, CircuitId, ControlError, Fingerprint, RelayDescriptor, Stream};
use tracing::debug;

/// Result type for control-link calls
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Operations the pool manager and the validation engine need from the
/// overlay client (allows mocking in tests)
#[async_trait]
pub trait ControlLink: Send + Sync {
    /// All circuits the client currently knows about
    async fn list_circuits(&self) -> ControlResult<Vec<Circuit>>;

    async fn get_circuit(&self, id: &str) -> ControlResult<Circuit>;

    /// Consensus entry for one relay
    async fn relay_status(&self, fingerprint: &str) -> ControlResult<RelayDescriptor>;

    /// Request a circuit along `path` without waiting for it to finish building
    async fn build_circuit(&self, path: &[Fingerprint]) -> ControlResult<CircuitId>;

    async fn close_circuit(&self, id: &str) -> ControlResult<()>;

    async fn list_streams(&self) -> ControlResult<Vec<Stream>>;

    async fn attach_stream(&self, stream: &str, circuit: &str) -> ControlResult<()>;

    async fn close_stream(&self, stream: &str) -> ControlResult<()>;

    /// Full current consensus
    async fn fetch_consensus(&self) -> ControlResult<Vec<RelayDescriptor>>;
}

/// Address used when a circuit's exit cannot be resolved
pub const UNKNOWN_EXIT: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Address of the circuit's last hop, or `0.0.0.0` if it cannot be resolved
pub async fn exit_ip_of<C: ControlLink + ?Sized>(link: &C, circuit: &Circuit) -> Ipv4Addr {
    let Some(exit) = circuit.exit() else {
        return UNKNOWN_EXIT;
    };
    match link.relay_status(exit).await {
        Ok(relay) => relay.address,
        Err(e) => {
            debug!("Exit {} of circuit {} unresolved: {}", exit, circuit.id, e);
            UNKNOWN_EXIT
        }
    }
}

/// Ids of circuits that carry at least one stream the client still lists
pub async fn circuits_with_open_streams<C: ControlLink + ?Sized>(
    link: &C,
) -> ControlResult<HashSet<CircuitId>> {
    Ok(link
        .list_streams()
        .await?
        .into_iter()
        .filter(Stream::is_open_on_circuit)
        .filter_map(|stream| stream.circuit_id)
        .collect())
}
