//! Multi-node coordinator for collaborative record editing.
//!
//! Clients editing the same record join one room over WebSocket. Room state lives in a
//! shared store and room traffic crosses nodes on a topic bus, so any node can serve any
//! client.

pub mod access;
pub mod arbiter;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod room;
pub mod sequencer;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod websocket;
