//! Core type definitions for the overlay data model

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Relay identity (hex-encoded identity digest, uppercase)
pub type Fingerprint = String;

/// Circuit id assigned by the overlay client
pub type CircuitId = String;

/// Stream id assigned by the overlay client
pub type StreamId = String;

/// Current wall-clock time as fractional unix seconds
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Capability flags carried by a consensus entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelayFlag {
    Authority,
    BadExit,
    Exit,
    Fast,
    Guard,
    HsDir,
    MiddleOnly,
    NoEdConsensus,
    Running,
    Stable,
    StaleDesc,
    V2Dir,
    Valid,
}

impl std::str::FromStr for RelayFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authority" => Ok(Self::Authority),
            "BadExit" => Ok(Self::BadExit),
            "Exit" => Ok(Self::Exit),
            "Fast" => Ok(Self::Fast),
            "Guard" => Ok(Self::Guard),
            "HSDir" => Ok(Self::HsDir),
            "MiddleOnly" => Ok(Self::MiddleOnly),
            "NoEdConsensus" => Ok(Self::NoEdConsensus),
            "Running" => Ok(Self::Running),
            "Stable" => Ok(Self::Stable),
            "StaleDesc" => Ok(Self::StaleDesc),
            "V2Dir" => Ok(Self::V2Dir),
            "Valid" => Ok(Self::Valid),
            _ => Err(format!("Unknown relay flag: {}", s)),
        }
    }
}

/// One relay as seen in a single consensus fetch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub address: Ipv4Addr,
    /// Consensus bandwidth weight
    pub bandwidth: u64,
    pub flags: BTreeSet<RelayFlag>,
}

impl RelayDescriptor {
    pub fn has_flag(&self, flag: RelayFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Circuit build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Launched,
    Extended,
    GuardWait,
    Built,
    Failed,
    Closed,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launched => write!(f, "LAUNCHED"),
            Self::Extended => write!(f, "EXTENDED"),
            Self::GuardWait => write!(f, "GUARD_WAIT"),
            Self::Built => write!(f, "BUILT"),
            Self::Failed => write!(f, "FAILED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

impl std::str::FromStr for CircuitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LAUNCHED" => Ok(Self::Launched),
            "EXTENDED" => Ok(Self::Extended),
            "GUARD_WAIT" => Ok(Self::GuardWait),
            "BUILT" => Ok(Self::Built),
            "FAILED" => Ok(Self::Failed),
            "CLOSED" => Ok(Self::Closed),
            _ => Err(format!("Invalid circuit status: {}", s)),
        }
    }
}

/// A circuit as reported by the control link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    pub id: CircuitId,
    pub status: CircuitStatus,
    /// Hops from entry to exit
    pub path: Vec<Fingerprint>,
}

impl Circuit {
    pub fn is_built(&self) -> bool {
        self.status == CircuitStatus::Built
    }

    /// Last hop of the path, if the circuit has one
    pub fn exit(&self) -> Option<&Fingerprint> {
        self.path.last()
    }
}

/// Stream status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    New,
    NewResolve,
    Remap,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    ControllerWait,
}

impl StreamStatus {
    /// Statuses reached once the connection attempt is over; the target is
    /// then the address the exit actually connected to
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Closed | Self::Detached
        )
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::NewResolve => write!(f, "NEWRESOLVE"),
            Self::Remap => write!(f, "REMAP"),
            Self::SentConnect => write!(f, "SENTCONNECT"),
            Self::SentResolve => write!(f, "SENTRESOLVE"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Detached => write!(f, "DETACHED"),
            Self::ControllerWait => write!(f, "CONTROLLER_WAIT"),
        }
    }
}

impl std::str::FromStr for StreamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "NEWRESOLVE" => Ok(Self::NewResolve),
            "REMAP" => Ok(Self::Remap),
            "SENTCONNECT" => Ok(Self::SentConnect),
            "SENTRESOLVE" => Ok(Self::SentResolve),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CLOSED" => Ok(Self::Closed),
            "DETACHED" => Ok(Self::Detached),
            "CONTROLLER_WAIT" => Ok(Self::ControllerWait),
            _ => Err(format!("Invalid stream status: {}", s)),
        }
    }
}

/// A stream as reported by the control link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub status: StreamStatus,
    /// Circuit the stream is attached to, if any
    pub circuit_id: Option<CircuitId>,
    /// Target as `host:port`
    pub target: String,
    /// SOCKS username the stream was opened with, when the link reports it
    #[serde(default)]
    pub socks_username: Option<String>,
}

impl Stream {
    /// Host part of the target, without the port
    pub fn target_address(&self) -> &str {
        match self.target.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.target,
        }
    }

    /// Attached to a circuit the client still lists it on
    ///
    /// SUCCEEDED is the established state that carries the fetch, so any
    /// listed, attached stream counts.
    pub fn is_open_on_circuit(&self) -> bool {
        self.circuit_id.is_some()
    }
}

/// Fetch scheme for a validation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => Err(format!("Invalid protocol: {}", s)),
        }
    }
}

/// An IPv4 address block, `network/prefix_len`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    /// Block of length `prefix_len` containing `addr` (non-strict masking)
    pub fn of(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        let mask = if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        };
        Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        Self::of(addr, self.prefix_len) == *self
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}
