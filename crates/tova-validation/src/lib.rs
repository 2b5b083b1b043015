//! # tova-validation
//!
//! Multi-vantage-point validation: one request, several fetches over
//! distinct circuits, one k-of-n verdict.
//!
//! This crate provides:
//! - Vote tally with a deterministic tie-break
//! - Result shortening for session logs
//! - Fetchers: SOCKS-routed HTTP, and a scripted one for tests
//! - The session engine that binds fetch streams to circuits

#![allow(dead_code)]

mod fetch;
mod scripted;
mod session;
mod tally;
mod truncate;

pub use fetch::{FetchErrorKind, Fetcher, OverlayFetcher};
pub use scripted::ScriptedFetcher;
pub use session::{SessionConfig, SessionRecord, ValidationEngine, VantageResult, Verdict};
pub use tally::{is_error, Decision, Tally, ERROR_PREFIX, NO_QUORUM};
pub use truncate::{logged_len, truncate_for_log, HEAD_BYTES, TAIL_BYTES};
