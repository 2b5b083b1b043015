//! Relay catalog: the usable guard and exit sets of the current consensus

use std::time::Duration;
use tova_control::ControlLink;
use tova_core::fail_open::retry_fixed;
use tova_core::{ControlError, RelayDescriptor, RelayFlag};
use tracing::{debug, warn};

/// Consensus fetch attempts per refresh
pub const FETCH_ATTEMPTS: usize = 3;

/// Pause between consensus fetch attempts
pub const FETCH_BACKOFF: Duration = Duration::from_secs(1);

/// Split relays into (guards, exits)
///
/// Exits are running, exit-flagged and not marked bad. Guards are running,
/// fast, guard-flagged relays that are not exits.
pub fn classify(relays: Vec<RelayDescriptor>) -> (Vec<RelayDescriptor>, Vec<RelayDescriptor>) {
    let (exits, rest): (Vec<_>, Vec<_>) = relays.into_iter().partition(|relay| {
        relay.has_flag(RelayFlag::Exit)
            && !relay.has_flag(RelayFlag::BadExit)
            && relay.has_flag(RelayFlag::Running)
    });
    let guards = rest
        .into_iter()
        .filter(|relay| {
            relay.has_flag(RelayFlag::Guard)
                && relay.has_flag(RelayFlag::Fast)
                && relay.has_flag(RelayFlag::Running)
        })
        .collect();
    (guards, exits)
}

/// Fetch and classify the consensus
///
/// Retries transient failures; returns two empty lists once the attempts
/// are exhausted or the link rejects the request outright.
pub async fn fetch_relays<C: ControlLink + ?Sized>(
    link: &C,
) -> (Vec<RelayDescriptor>, Vec<RelayDescriptor>) {
    fetch_relays_with_backoff(link, FETCH_BACKOFF).await
}

pub async fn fetch_relays_with_backoff<C: ControlLink + ?Sized>(
    link: &C,
    backoff: Duration,
) -> (Vec<RelayDescriptor>, Vec<RelayDescriptor>) {
    let fetched = retry_fixed(
        "fetch_consensus",
        FETCH_ATTEMPTS,
        backoff,
        ControlError::is_retryable,
        || link.fetch_consensus(),
    )
    .await;

    match fetched {
        Ok(relays) => classify(relays),
        Err(e) => {
            warn!("Failed to retrieve relays: {}", e);
            (Vec::new(), Vec::new())
        }
    }
}

/// Last known-good guard and exit lists
#[derive(Debug, Clone)]
pub struct RelayCatalog {
    guards: Vec<RelayDescriptor>,
    exits: Vec<RelayDescriptor>,
    backoff: Duration,
}

impl Default for RelayCatalog {
    fn default() -> Self {
        Self {
            guards: Vec::new(),
            exits: Vec::new(),
            backoff: FETCH_BACKOFF,
        }
    }
}

impl RelayCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the pause between consensus fetch attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn guards(&self) -> &[RelayDescriptor] {
        &self.guards
    }

    pub fn exits(&self) -> &[RelayDescriptor] {
        &self.exits
    }

    /// True until both lists have been populated at least once
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty() && self.exits.is_empty()
    }

    /// Replace each list with its new version unless the new one is empty
    pub fn update(&mut self, guards: Vec<RelayDescriptor>, exits: Vec<RelayDescriptor>) {
        if !guards.is_empty() {
            self.guards = guards;
        }
        if !exits.is_empty() {
            self.exits = exits;
        }
    }

    /// Fetch the consensus and update, keeping previous lists on failure
    pub async fn refresh<C: ControlLink + ?Sized>(&mut self, link: &C) {
        let (guards, exits) = fetch_relays_with_backoff(link, self.backoff).await;
        debug!(
            "Consensus yielded {} guards and {} exits",
            guards.len(),
            exits.len()
        );
        self.update(guards, exits);
    }
}
