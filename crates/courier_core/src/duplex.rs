//! Duplex connection abstraction.
//!
//! The gateway core never touches sockets directly. The server crate wraps an
//! upgraded WebSocket in a type implementing [`DuplexConnection`]; tests use
//! the scripted connection from `test_utils`.
//!
//! # Contract
//!
//! - `send` and `close` are serialized per connection, so concurrent fan-out
//!   tasks may call `send` on the same connection.
//! - `is_connected` actively probes the peer with a control frame and flips
//!   the connection to disconnected on failure. Once it returns `false` it
//!   never returns `true` again.
//! - `last_known_connected` reports the current state without probing. It
//!   turns `false` as soon as any send, receive or probe has failed.
//! - `receive` blocks until a data frame arrives; control frames are
//!   consumed internally. An error means the transport is gone.
//! - `close` is idempotent in effect; the underlying transport close runs
//!   once.

use crate::error::TransportError;
use async_trait::async_trait;

#[async_trait]
pub trait DuplexConnection: Send + Sync {
    /// Connection id assigned at upgrade time.
    fn id(&self) -> &str;

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    async fn receive(&self) -> Result<Vec<u8>, TransportError>;

    async fn is_connected(&self) -> bool;

    fn last_known_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), TransportError>;
}
