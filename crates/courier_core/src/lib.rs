//! # `courier_core`
//!
//! Core of the Courier real-time messaging gateway.
//!
//! Every node in a Courier cluster accepts long-lived client connections and
//! shares one coordination store with its peers. This crate holds everything
//! that does not depend on a concrete socket or store client:
//!
//! - the single-writer [`coordinator`] that owns the node's connection
//!   registry,
//! - the per-connection [`delivery`] loops (heartbeat, receive, push and
//!   ack-retry),
//! - the per-user message [`queue`], delay queue and ack records,
//! - the [`forward`]ing port used to reach connections held by other nodes,
//! - the startup [`sweep`] of presence left behind by a crashed node,
//! - and [`Gateway`], the management surface that ties them together.
//!
//! Sockets come in through [`DuplexConnection`] and the shared store through
//! [`CoordinationStore`]; [`MemoryStore`] is the in-process implementation.

pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod descriptor;
pub mod duplex;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod message;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod store;
pub mod sweep;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::DeliveryConfig;
pub use descriptor::ConnectionDescriptor;
pub use duplex::DuplexConnection;
pub use error::{GatewayError, Result, StoreError, TransportError};
pub use forward::{Envelope, Forwarder};
pub use gateway::{CloseAllSummary, Gateway};
pub use message::{InboundFrame, Message};
pub use store::{CoordinationStore, MemoryStore};
pub use sweep::SweepReport;
