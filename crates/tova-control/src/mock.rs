//! In-memory control link for tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tova_core::{
    Circuit, CircuitId, CircuitStatus, ControlError, Fingerprint, RelayDescriptor, Stream,
    StreamId, StreamStatus,
};

use crate::link::{ControlLink, ControlResult};

#[derive(Default)]
struct MockState {
    relays: Vec<RelayDescriptor>,
    circuits: BTreeMap<CircuitId, Circuit>,
    streams: BTreeMap<StreamId, Stream>,
    next_circuit: u64,
    next_stream: u64,
    /// Upcoming consensus fetches that report DescriptorUnavailable
    consensus_failures: usize,
    consensus_calls: usize,
    /// Builds whose path ends at one of these exits are rejected
    rejected_exits: HashSet<Fingerprint>,
    /// Attaching to these circuits is rejected
    rejected_attach: HashSet<CircuitId>,
    built: Vec<Vec<Fingerprint>>,
    closed_circuits: Vec<CircuitId>,
    closed_streams: Vec<StreamId>,
    attachments: Vec<(StreamId, CircuitId)>,
}

/// Scriptable control link
///
/// Clones share state, so a test can hand one clone to the code under test
/// and keep another to script and inspect it.
#[derive(Clone, Default)]
pub struct MockControlLink {
    state: Arc<Mutex<MockState>>,
}

impl MockControlLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_relays(self, relays: Vec<RelayDescriptor>) -> Self {
        self.state().relays = relays;
        self
    }

    /// Register an existing circuit
    pub fn add_circuit(&self, id: &str, status: CircuitStatus, path: &[&str]) {
        let mut state = self.state();
        state.circuits.insert(
            id.to_string(),
            Circuit {
                id: id.to_string(),
                status,
                path: path.iter().map(|hop| hop.to_string()).collect(),
            },
        );
    }

    pub fn set_circuit_status(&self, id: &str, status: CircuitStatus) {
        if let Some(circuit) = self.state().circuits.get_mut(id) {
            circuit.status = status;
        }
    }

    /// Drop a circuit without recording a close, as if it failed upstream
    pub fn vanish_circuit(&self, id: &str) {
        self.state().circuits.remove(id);
    }

    /// Open a new unattached stream towards `target` (`host:port`)
    pub fn open_stream(&self, target: &str) -> StreamId {
        self.open_stream_with(target, None)
    }

    /// Open a new unattached stream the way a SOCKS client authenticating as
    /// `username` would
    pub fn open_stream_as(&self, target: &str, username: &str) -> StreamId {
        self.open_stream_with(target, Some(username))
    }

    fn open_stream_with(&self, target: &str, username: Option<&str>) -> StreamId {
        let mut state = self.state();
        state.next_stream += 1;
        let id = state.next_stream.to_string();
        state.streams.insert(
            id.clone(),
            Stream {
                id: id.clone(),
                status: StreamStatus::New,
                circuit_id: None,
                target: target.to_string(),
                socks_username: username.map(str::to_string),
            },
        );
        id
    }

    /// Add a stream already attached to a circuit
    pub fn add_stream(&self, id: &str, status: StreamStatus, circuit: Option<&str>, target: &str) {
        self.state().streams.insert(
            id.to_string(),
            Stream {
                id: id.to_string(),
                status,
                circuit_id: circuit.map(str::to_string),
                target: target.to_string(),
                socks_username: None,
            },
        );
    }

    pub fn set_stream_status(&self, id: &str, status: StreamStatus) {
        if let Some(stream) = self.state().streams.get_mut(id) {
            stream.status = status;
        }
    }

    pub fn stream(&self, id: &str) -> Option<Stream> {
        self.state().streams.get(id).cloned()
    }

    /// Poll until `stream` is attached or gone; `None` when it was closed
    pub async fn wait_for_attachment(&self, stream: &str, timeout: Duration) -> Option<CircuitId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.stream(stream) {
                Some(s) if s.circuit_id.is_some() => return s.circuit_id,
                Some(_) => {}
                None => return None,
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn fail_consensus(&self, times: usize) {
        self.state().consensus_failures = times;
    }

    pub fn consensus_calls(&self) -> usize {
        self.state().consensus_calls
    }

    pub fn reject_builds_through(&self, exit: &str) {
        self.state().rejected_exits.insert(exit.to_string());
    }

    pub fn reject_attach_to(&self, circuit: &str) {
        self.state().rejected_attach.insert(circuit.to_string());
    }

    pub fn circuits(&self) -> Vec<Circuit> {
        self.state().circuits.values().cloned().collect()
    }

    /// Paths of every accepted build request, in order
    pub fn built_paths(&self) -> Vec<Vec<Fingerprint>> {
        self.state().built.clone()
    }

    pub fn closed_circuits(&self) -> Vec<CircuitId> {
        self.state().closed_circuits.clone()
    }

    pub fn closed_streams(&self) -> Vec<StreamId> {
        self.state().closed_streams.clone()
    }

    pub fn attachments(&self) -> Vec<(StreamId, CircuitId)> {
        self.state().attachments.clone()
    }
}

#[async_trait]
impl ControlLink for MockControlLink {
    async fn list_circuits(&self) -> ControlResult<Vec<Circuit>> {
        Ok(self.circuits())
    }

    async fn get_circuit(&self, id: &str) -> ControlResult<Circuit> {
        self.state()
            .circuits
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::InvalidArguments(format!("unknown circuit {}", id)))
    }

    async fn relay_status(&self, fingerprint: &str) -> ControlResult<RelayDescriptor> {
        self.state()
            .relays
            .iter()
            .find(|r| r.fingerprint == fingerprint)
            .cloned()
            .ok_or_else(|| ControlError::DescriptorUnavailable(fingerprint.to_string()))
    }

    async fn build_circuit(&self, path: &[Fingerprint]) -> ControlResult<CircuitId> {
        let mut state = self.state();
        if path.is_empty() {
            return Err(ControlError::InvalidRequest("empty path".to_string()));
        }
        if path.iter().any(|hop| state.rejected_exits.contains(hop)) {
            return Err(ControlError::ExtensionFailed(format!("{:?}", path)));
        }
        state.next_circuit += 1;
        let id = (100 + state.next_circuit).to_string();
        state.circuits.insert(
            id.clone(),
            Circuit {
                id: id.clone(),
                status: CircuitStatus::Built,
                path: path.to_vec(),
            },
        );
        state.built.push(path.to_vec());
        Ok(id)
    }

    async fn close_circuit(&self, id: &str) -> ControlResult<()> {
        let mut state = self.state();
        if state.circuits.remove(id).is_none() {
            return Err(ControlError::InvalidArguments(format!("unknown circuit {}", id)));
        }
        state.closed_circuits.push(id.to_string());
        Ok(())
    }

    async fn list_streams(&self) -> ControlResult<Vec<Stream>> {
        Ok(self.state().streams.values().cloned().collect())
    }

    async fn attach_stream(&self, stream: &str, circuit: &str) -> ControlResult<()> {
        let mut state = self.state();
        if state.rejected_attach.contains(circuit) {
            return Err(ControlError::InvalidRequest(format!(
                "cannot attach {} to {}",
                stream, circuit
            )));
        }
        if !state.circuits.contains_key(circuit) {
            return Err(ControlError::InvalidArguments(format!("unknown circuit {}", circuit)));
        }
        let entry = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| ControlError::InvalidArguments(format!("unknown stream {}", stream)))?;
        if entry.circuit_id.is_some() {
            return Err(ControlError::InvalidRequest(format!(
                "stream {} already attached",
                stream
            )));
        }
        entry.circuit_id = Some(circuit.to_string());
        entry.status = StreamStatus::SentConnect;
        state
            .attachments
            .push((stream.to_string(), circuit.to_string()));
        Ok(())
    }

    async fn close_stream(&self, stream: &str) -> ControlResult<()> {
        let mut state = self.state();
        if state.streams.remove(stream).is_none() {
            return Err(ControlError::InvalidArguments(format!("unknown stream {}", stream)));
        }
        state.closed_streams.push(stream.to_string());
        Ok(())
    }

    async fn fetch_consensus(&self) -> ControlResult<Vec<RelayDescriptor>> {
        let mut state = self.state();
        state.consensus_calls += 1;
        if state.consensus_failures > 0 {
            state.consensus_failures -= 1;
            return Err(ControlError::DescriptorUnavailable("ns/all".to_string()));
        }
        Ok(state.relays.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::circuits_with_open_streams;

    #[tokio::test]
    async fn test_mock_attach_flow() {
        let link = MockControlLink::new();
        link.add_circuit("5", CircuitStatus::Built, &["G", "E"]);
        let stream = link.open_stream("example.org:80");

        link.attach_stream(&stream, "5").await.unwrap();
        assert_eq!(
            link.wait_for_attachment(&stream, Duration::from_millis(50))
                .await
                .as_deref(),
            Some("5")
        );
        assert!(circuits_with_open_streams(&link)
            .await
            .unwrap()
            .contains("5"));

        // Established streams still pin their circuit until the client drops them
        link.set_stream_status(&stream, StreamStatus::Succeeded);
        assert!(circuits_with_open_streams(&link)
            .await
            .unwrap()
            .contains("5"));
        link.close_stream(&stream).await.unwrap();
        assert!(circuits_with_open_streams(&link).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_stream_keeps_socks_username() {
        let link = MockControlLink::new();
        let stream = link.open_stream_as("example.org:443", "tova-7");
        let listed = link.list_streams().await.unwrap();
        assert_eq!(listed[0].id, stream);
        assert_eq!(listed[0].socks_username.as_deref(), Some("tova-7"));
    }

    #[tokio::test]
    async fn test_mock_rejections() {
        let link = MockControlLink::new();
        assert!(matches!(
            link.close_circuit("404").await,
            Err(ControlError::InvalidArguments(_))
        ));

        link.reject_builds_through("BADEXIT");
        assert!(matches!(
            link.build_circuit(&["G".into(), "BADEXIT".into()]).await,
            Err(ControlError::ExtensionFailed(_))
        ));
        assert!(link.built_paths().is_empty());

        link.fail_consensus(1);
        assert!(link.fetch_consensus().await.is_err());
        assert!(link.fetch_consensus().await.is_ok());
        assert_eq!(link.consensus_calls(), 2);
    }
}
