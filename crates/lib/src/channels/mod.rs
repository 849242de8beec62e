//! Beagle channel: sidecar client, transports, inbound events, and account registry.
//!
//! The transport turns a sidecar connection into a stream of raw events; the service
//! normalizes and dispatches them. Outbound sends go straight through [`SidecarClient`].

pub mod events;
pub mod inbound;
pub mod registry;
pub mod sidecar;
pub mod transport;

pub use events::{BridgeEvent, EventBus, EventKind, SubscriptionId};
pub use inbound::{EventNormalizer, InboundMessage, RawEvent};
pub use registry::{AccountHandle, AccountRegistry};
pub use sidecar::{MediaMessage, OutboundSender, SentMessage, SidecarClient};
pub use transport::{ConnectionState, Connector, SidecarTransport};
