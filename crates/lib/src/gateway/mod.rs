//! Gateway: local HTTP surface over the running bridge.
//!
//! `GET /` reports per-account connection state; `POST /send` and `POST /sendMedia`
//! push outbound messages through an account's sidecar.

mod protocol;
mod server;

pub use protocol::{AccountStatus, SendMediaParams, SendParams, SendResult, StatusResponse};
pub use server::{router, run_gateway, serve_gateway, shutdown_signal, GatewayState};
