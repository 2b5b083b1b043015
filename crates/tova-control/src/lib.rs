//! # tova-control
//!
//! Control link layer between tova and the overlay client.
//!
//! This crate provides:
//! - The `ControlLink` abstraction consumed by the pool manager and the validation engine
//! - A Tor control-port implementation over tokio TCP
//! - A scriptable in-memory link for tests

mod link;
mod mock;
pub mod parse;
mod tor;

pub use link::{circuits_with_open_streams, exit_ip_of, ControlLink, ControlResult, UNKNOWN_EXIT};
pub use mock::MockControlLink;
pub use tor::{TorControl, CONNECT_BACKOFF};
