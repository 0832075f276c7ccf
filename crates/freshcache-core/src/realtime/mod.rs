//! Real-time push channel.
//!
//! This module provides:
//! - `InboundEvent`: the `{type, payload}` wire format
//! - `EventRouter`: entity to cache-key table plus derived notifications
//! - `PushTransport` / `WsTransport`: the connection seam
//! - `RealTimeChannel`: connection state machine with fixed-interval reconnect
//! - `spawn_background_refetch`: periodic invalidation of high-value keys
//!
//! Delivery is at most once. Missed events are covered by the background
//! refetch, never by retransmission.

pub mod channel;
pub mod event;
pub mod refetch;
pub mod router;
pub mod transport;

pub use channel::{
    ChannelConfig, ChannelState, EventHandler, ListenerToken, RealTimeChannel,
    RealTimeChannelBuilder,
};
pub use event::{auth_handshake, DataAction, DataUpdate, EventKind, InboundEvent, UserActivity};
pub use refetch::{default_refetch_keys, spawn_background_refetch};
pub use router::{AlertTemplate, EventRouter, KeyTemplate, RouteOutcome};
pub use transport::{PushConnection, PushTransport, WsTransport};
