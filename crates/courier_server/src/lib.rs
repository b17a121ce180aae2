//! # `courier_server`
//!
//! One node of a Courier cluster: the WebSocket endpoint clients connect
//! to, the management HTTP surface, the node-to-node forwarder and the
//! Redis-backed coordination store. The delivery logic lives in
//! [`courier_core`].

pub mod config;
pub mod forwarder;
pub mod handlers;
pub mod redis_store;
pub mod ws_connection;
