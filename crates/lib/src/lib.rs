//! Beagle bridge library: sidecar transport, inbound pipeline, dispatch, and gateway
//! used by the `beagle` CLI.

pub mod agent;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod init;
pub mod routing;
pub mod service;
pub mod session;

pub use error::{BridgeError, ErrorKind};
