//! Network Front End
//!
//! TCP and UDP traffic is multiplexed on one single-threaded event loop;
//! HTTP is served by axum. All three hand `(Connection, message)` pairs to a
//! [`MessageHandler`].

mod connection;
mod framing;
mod http;
mod server;

pub use connection::{
    Connection, HttpConnection, RECORD_SEPARATOR, TcpConnection, Transport, UdpConnection,
};
pub use framing::{Frame, LineFramer};
pub use http::create_router;
pub use server::{NetworkHandle, NetworkServer};

#[cfg(test)]
pub(crate) use connection::testing;

use std::sync::Arc;

use bytes::Bytes;

/// Receive callback for complete messages
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, connection: Arc<dyn Connection>, message: Bytes);
}
