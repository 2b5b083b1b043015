//! Validation session engine
//!
//! For one request the engine launches fetches in rounds. Every fetch opens a
//! stream on the overlay client under its own SOCKS username, and the client
//! leaves it unattached; the engine recognises its streams by those names,
//! picks a distinct, fresh circuit for each and attaches it. Completed
//! fetches are tallied until a result reaches `val_k` votes or `val_n`
//! fetches have been spent.

use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tova_control::{exit_ip_of, ControlLink, UNKNOWN_EXIT};
use tova_core::{
    unix_now, Circuit, CircuitId, Protocol, RecordSink, Stream, StreamId, StreamStatus,
    TovaConfig,
};
use tova_registry::{within_ttl, CircuitRegistry};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::fetch::{FetchErrorKind, Fetcher};
use crate::tally::{is_error, Tally};
use crate::truncate::truncate_for_log;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Votes needed for a verdict
    pub val_k: usize,
    /// Fetch budget per session
    pub val_n: usize,
    pub circuit_ttl: u64,
    /// Hard cap on session duration
    pub session_timeout: Duration,
    /// Stream polling period
    pub poll_interval: Duration,
}

impl SessionConfig {
    pub fn from_config(config: &TovaConfig) -> Self {
        Self {
            val_k: config.val_k,
            val_n: config.val_n,
            circuit_ttl: config.circuit_ttl,
            session_timeout: config.session_timeout(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// One vantage point's view: `[exit_ip, target_ip, result]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "(String, String, String)")]
pub struct VantageResult {
    pub exit_ip: String,
    /// Address the exit connected to, empty if never observed
    pub target_ip: String,
    /// Result as logged (long bodies shortened)
    pub result: String,
}

impl From<VantageResult> for (String, String, String) {
    fn from(r: VantageResult) -> Self {
        (r.exit_ip, r.target_ip, r.result)
    }
}

/// Session log record
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub req_start: f64,
    pub req_end: f64,
    pub ok: bool,
    pub domain: String,
    pub verdict: String,
    pub confidence: usize,
    pub results: Vec<VantageResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub output: String,
    pub confidence: usize,
    /// Fetches launched
    pub attempts: usize,
    pub results: Vec<VantageResult>,
    /// The session hit its absolute timeout
    pub timed_out: bool,
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        !is_error(&self.output)
    }
}

enum Attachment {
    Attached,
    NoCircuit,
    Rejected,
}

/// SOCKS username for one fetch, unique across sessions and processes
fn fetch_socks_user() -> String {
    format!("tova-{}", Uuid::new_v4().simple())
}

/// State of one request
struct Session {
    domain: String,
    tally: Tally,
    /// Circuits attached to or excluded in this session
    used: HashSet<CircuitId>,
    /// SOCKS usernames of fetches whose stream has no circuit yet
    pending: HashSet<String>,
    /// Streams this session attached or gave up on
    bound: HashSet<StreamId>,
    /// Stream each fetch was attached through, by SOCKS username
    fetch_streams: HashMap<String, StreamId>,
    stream_exits: HashMap<StreamId, Ipv4Addr>,
    /// Address the exit connected to, once the stream got that far
    stream_targets: HashMap<StreamId, String>,
    results: Vec<VantageResult>,
}

impl Session {
    fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            tally: Tally::new(),
            used: HashSet::new(),
            pending: HashSet::new(),
            bound: HashSet::new(),
            fetch_streams: HashMap::new(),
            stream_exits: HashMap::new(),
            stream_targets: HashMap::new(),
            results: Vec::new(),
        }
    }

    /// A fresh stream opened by one of this session's fetches
    fn is_candidate(&self, stream: &Stream) -> bool {
        stream.status == StreamStatus::New
            && stream.circuit_id.is_none()
            && stream
                .socks_username
                .as_ref()
                .is_some_and(|user| self.pending.contains(user))
            && stream.target_address().eq_ignore_ascii_case(&self.domain)
            && !self.bound.contains(&stream.id)
    }

    fn bind(&mut self, stream: &Stream, circuit: &str, exit: Ipv4Addr) {
        self.bound.insert(stream.id.clone());
        self.used.insert(circuit.to_string());
        self.stream_exits.insert(stream.id.clone(), exit);
        if let Some(user) = &stream.socks_username {
            self.pending.remove(user);
            self.fetch_streams.insert(user.clone(), stream.id.clone());
        }
    }

    /// Give up on a stream whose attachment was refused; its fetch runs
    /// into its own timeout
    fn abandon(&mut self, stream: &Stream, circuit: &str) {
        self.bound.insert(stream.id.clone());
        self.used.insert(circuit.to_string());
        if let Some(user) = &stream.socks_username {
            self.pending.remove(user);
        }
    }

    /// Tally a completed fetch and log it against the exit of its own stream
    fn record(&mut self, socks_user: Option<&str>, result: &str) {
        self.tally.record(result);
        let stream = socks_user.and_then(|user| self.fetch_streams.get(user));
        let (exit_ip, target_ip) = match stream {
            Some(stream) => (
                self.stream_exits
                    .get(stream)
                    .copied()
                    .unwrap_or(UNKNOWN_EXIT)
                    .to_string(),
                self.stream_targets.get(stream).cloned().unwrap_or_default(),
            ),
            None => (UNKNOWN_EXIT.to_string(), String::new()),
        };
        if let Some(user) = socks_user {
            self.pending.remove(user);
        }
        self.results.push(VantageResult {
            exit_ip,
            target_ip,
            result: truncate_for_log(result),
        });
    }
}

/// Runs validation sessions against a shared control link and registry
pub struct ValidationEngine<C: ControlLink, R: CircuitRegistry, F: Fetcher + 'static> {
    link: C,
    registry: R,
    fetcher: Arc<F>,
    config: SessionConfig,
    sink: RecordSink,
}

impl<C: ControlLink, R: CircuitRegistry, F: Fetcher + 'static> ValidationEngine<C, R, F> {
    pub fn new(link: C, registry: R, fetcher: F, config: SessionConfig, sink: RecordSink) -> Self {
        Self {
            link,
            registry,
            fetcher: Arc::new(fetcher),
            config,
            sink,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Fetch `protocol://domain/challenge` from independent vantage points
    /// until quorum or exhaustion
    #[instrument(skip(self))]
    pub async fn run_session(&self, protocol: Protocol, domain: &str, challenge: &str) -> Verdict {
        let req_start = unix_now();
        let url = format!(
            "{}://{}/{}",
            protocol,
            domain,
            challenge.trim_start_matches('/')
        );
        let (k, n) = (self.config.val_k, self.config.val_n);

        let mut session = Session::new(domain);
        let mut attempts = 0;
        let mut timed_out = false;
        let deadline = sleep(self.config.session_timeout);
        tokio::pin!(deadline);

        let decision = 'session: loop {
            if let Some(decision) = session.tally.decide(k, n) {
                break decision;
            }
            let round = session
                .tally
                .round_size(k, n)
                .min(n.saturating_sub(attempts));
            if round == 0 {
                break session.tally.no_quorum();
            }
            debug!("Launching round of {} fetches", round);

            let mut tasks = JoinSet::new();
            for _ in 0..round {
                let socks_user = fetch_socks_user();
                session.pending.insert(socks_user.clone());
                let fetcher = Arc::clone(&self.fetcher);
                let url = url.clone();
                tasks.spawn(async move {
                    let result = fetcher.fetch(&url, &socks_user).await;
                    (socks_user, result)
                });
            }
            attempts += round;

            let mut slots = round;
            let mut attached = 0;
            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !tasks.is_empty() {
                tokio::select! {
                    _ = &mut deadline => {
                        warn!("Session for {} timed out after {} attempts", domain, attempts);
                        timed_out = true;
                        break 'session session
                            .tally
                            .decide(k, n)
                            .unwrap_or_else(|| session.tally.no_quorum());
                    }
                    Some(joined) = tasks.join_next() => {
                        let (socks_user, result) = match joined {
                            Ok((socks_user, result)) => (Some(socks_user), result),
                            Err(e) => {
                                warn!("Fetch task failed: {}", e);
                                (None, FetchErrorKind::Request.result())
                            }
                        };
                        self.poll_streams(&mut session, &mut slots, &mut attached).await;
                        session.record(socks_user.as_deref(), &result);
                        if let Some(decision) = session.tally.decide(k, n) {
                            // Dropping the JoinSet aborts fetches still in flight
                            break 'session decision;
                        }
                    }
                    _ = ticker.tick() => {
                        self.poll_streams(&mut session, &mut slots, &mut attached).await;
                    }
                }
            }
        };

        let record = SessionRecord {
            req_start,
            req_end: unix_now(),
            ok: decision.is_ok(),
            domain: domain.to_string(),
            verdict: truncate_for_log(&decision.output),
            confidence: decision.confidence,
            results: session.results.clone(),
        };
        self.sink.emit(&record).await;
        info!(
            "Verdict for {}: {} ({} votes, {} attempts)",
            domain,
            truncate_for_log(&decision.output),
            decision.confidence,
            attempts
        );

        Verdict {
            output: decision.output,
            confidence: decision.confidence,
            attempts,
            results: session.results,
            timed_out,
        }
    }

    /// Attach new streams for this session and note where finished ones went
    async fn poll_streams(&self, session: &mut Session, slots: &mut usize, attached: &mut usize) {
        let streams = match self.link.list_streams().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!("Stream listing failed: {}", e);
                return;
            }
        };

        for stream in streams {
            if session.is_candidate(&stream) {
                if *attached >= *slots {
                    continue;
                }
                match self.attach(&stream, session).await {
                    Attachment::Attached => *attached += 1,
                    Attachment::Rejected => *slots = slots.saturating_sub(1),
                    Attachment::NoCircuit => {}
                }
            } else if stream.status.is_terminal() && session.stream_exits.contains_key(&stream.id) {
                session
                    .stream_targets
                    .insert(stream.id.clone(), stream.target_address().to_string());
                if stream.status == StreamStatus::Detached {
                    if let Err(e) = self.link.close_stream(&stream.id).await {
                        debug!("Closing detached stream {} failed: {}", stream.id, e);
                    }
                }
            }
        }
    }

    async fn attach(&self, stream: &Stream, session: &mut Session) -> Attachment {
        let Some(circuit) = self.pick_circuit(session).await else {
            debug!("No eligible circuit for stream {} yet", stream.id);
            return Attachment::NoCircuit;
        };

        match self.link.attach_stream(&stream.id, &circuit.id).await {
            Ok(()) => {
                let exit = exit_ip_of(&self.link, &circuit).await;
                debug!(
                    "Attached stream {} to circuit {} (exit {})",
                    stream.id, circuit.id, exit
                );
                session.bind(stream, &circuit.id, exit);
                Attachment::Attached
            }
            Err(e) if e.is_rejection() => {
                warn!(
                    "Attaching stream {} to circuit {} rejected: {}",
                    stream.id, circuit.id, e
                );
                session.abandon(stream, &circuit.id);
                Attachment::Rejected
            }
            Err(e) => {
                debug!("Attaching stream {} failed: {}", stream.id, e);
                Attachment::NoCircuit
            }
        }
    }

    /// A random BUILT multi-hop circuit, unused in this session and within
    /// its TTL
    async fn pick_circuit(&self, session: &Session) -> Option<Circuit> {
        let mut candidates: Vec<Circuit> = match self.link.list_circuits().await {
            Ok(circuits) => circuits
                .into_iter()
                .filter(|c| c.is_built() && c.path.len() > 1 && !session.used.contains(&c.id))
                .collect(),
            Err(e) => {
                debug!("Circuit listing failed: {}", e);
                return None;
            }
        };
        candidates.shuffle(&mut rand::thread_rng());

        let now = unix_now();
        for circuit in candidates {
            match self.registry.get(&circuit.id).await {
                Ok(Some(created)) if within_ttl(created, self.config.circuit_ttl, now) => {
                    return Some(circuit);
                }
                Ok(Some(_)) => {}
                // Unknown to the registry: record it as fresh
                Ok(None) => match self.registry.insert_if_absent(&circuit.id, now).await {
                    Ok(_) => return Some(circuit),
                    Err(e) => warn!("Registry insert for {} failed: {}", circuit.id, e),
                },
                Err(e) => warn!("Registry read for {} failed: {}", circuit.id, e),
            }
        }
        None
    }
}
