//! Connections
//!
//! One abstraction over the three ways a request can reach the gateway.
//! Handlers answer through [`Connection::send`] without knowing which
//! transport carried the request.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Record separator written after every TCP/UDP response
pub const RECORD_SEPARATOR: u8 = b'\n';

/// Transport that carried a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Http,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
            Transport::Http => write!(f, "http"),
        }
    }
}

/// The originating side of a request
pub trait Connection: Send + Sync {
    fn transport(&self) -> Transport;

    /// Human-readable peer description for logs
    fn peer(&self) -> String;

    /// Write one response record. Never blocks on socket I/O.
    fn send(&self, payload: &[u8]) -> io::Result<()>;
}

fn framed(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(payload);
    buf.put_u8(RECORD_SEPARATOR);
    buf.freeze()
}

// ─────────────────────────────────────────────────────────────────────────────
// TCP
// ─────────────────────────────────────────────────────────────────────────────

/// Stream connection. Writes are handed to the connection's writer task.
#[derive(Debug)]
pub struct TcpConnection {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl TcpConnection {
    pub fn new(peer: SocketAddr, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { peer, outbound }
    }
}

impl Connection for TcpConnection {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.outbound
            .send(framed(payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UDP
// ─────────────────────────────────────────────────────────────────────────────

/// One datagram exchange. Responses go back to the sender address through
/// a non-blocking socket, so a full send buffer drops the reply.
#[derive(Debug)]
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpConnection {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl Connection for UdpConnection {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send_to(&framed(payload), self.peer).map(|_| ())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

/// One HTTP exchange. The first response completes it.
#[derive(Debug)]
pub struct HttpConnection {
    peer: String,
    reply: Mutex<Option<oneshot::Sender<Bytes>>>,
}

impl HttpConnection {
    /// Create the connection and the receiver the HTTP handler waits on
    pub fn new(peer: impl Into<String>) -> (Self, oneshot::Receiver<Bytes>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                peer: peer.into(),
                reply: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl Connection for HttpConnection {
    fn transport(&self) -> Transport {
        Transport::Http
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let reply = self
            .reply
            .lock()
            .take()
            .ok_or_else(|| io::Error::other("response already sent"))?;
        reply
            .send(Bytes::copy_from_slice(payload))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_send_appends_separator() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = TcpConnection::new("127.0.0.1:1".parse().unwrap(), tx);

        conn.send(br#"{"status":"success"}"#).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"{\"status\":\"success\"}\n"));

        drop(rx);
        assert!(conn.send(b"{}").is_err());
    }

    #[test]
    fn test_http_connection_answers_once() {
        let (conn, mut rx) = HttpConnection::new("client");
        conn.send(b"{}").unwrap();
        assert!(conn.send(b"{}").is_err());
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"{}"));
    }
}
