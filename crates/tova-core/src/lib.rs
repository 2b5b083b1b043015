//! # tova-core
//!
//! Core types for tova, multi-vantage-point domain validation over an
//! anonymity overlay.
//!
//! ## Core Paradigm
//!
//! - A vantage point IS one overlay circuit
//! - Path diversity IS one exit subnet per circuit
//! - A verdict IS a k-of-n vote over independently fetched content
//! - The only state shared between processes IS the circuit registry

pub mod config;
mod error;
pub mod fail_open;
pub mod record;
mod types;

pub use config::{DeploymentConfig, TovaConfig};
pub use error::{ConfigError, ControlError, Result, TovaError};
pub use record::RecordSink;
pub use types::*;
