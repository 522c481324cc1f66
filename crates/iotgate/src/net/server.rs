//! TCP/UDP Event Loop
//!
//! Sockets are bound up front (so callers learn the real addresses, which
//! matters for port 0) and then moved onto a dedicated `net-event-loop`
//! thread running a current-thread tokio runtime. Its reactor is the
//! readiness multiplexer for every listener, stream and datagram socket.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::connection::{Connection, TcpConnection, UdpConnection};
use super::framing::{Frame, LineFramer, trim};
use super::MessageHandler;
use crate::config::ServerConfig;

/// Largest payload a UDP datagram can carry
const MAX_DATAGRAM: usize = 65_507;

/// Bound-but-not-yet-running TCP/UDP front end
#[derive(Debug)]
pub struct NetworkServer {
    tcp: Vec<std::net::TcpListener>,
    udp: Vec<std::net::UdpSocket>,
    max_message_bytes: usize,
}

impl NetworkServer {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            tcp: Vec::new(),
            udp: Vec::new(),
            max_message_bytes,
        }
    }

    /// Bind every TCP and UDP port listed in `config`
    pub fn bind(config: &ServerConfig) -> io::Result<Self> {
        let mut server = Self::new(config.max_message_bytes);
        for port in &config.tcp_ports {
            server.bind_tcp((config.host.as_str(), *port))?;
        }
        for port in &config.udp_ports {
            server.bind_udp((config.host.as_str(), *port))?;
        }
        Ok(server)
    }

    pub fn bind_tcp(&mut self, addr: impl ToSocketAddrs) -> io::Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        self.tcp.push(listener);
        Ok(local)
    }

    pub fn bind_udp(&mut self, addr: impl ToSocketAddrs) -> io::Result<SocketAddr> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        self.udp.push(socket);
        Ok(local)
    }

    /// Move all sockets onto the event-loop thread and start serving
    pub fn start(self, handler: Arc<dyn MessageHandler>) -> io::Result<NetworkHandle> {
        let tcp_addrs = self
            .tcp
            .iter()
            .map(|l| l.local_addr())
            .collect::<io::Result<Vec<_>>>()?;
        let udp_addrs = self
            .udp
            .iter()
            .map(|s| s.local_addr())
            .collect::<io::Result<Vec<_>>>()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("net-event-loop".to_string())
            .spawn(move || runtime.block_on(self.run(handler, shutdown_rx)))?;

        for addr in &tcp_addrs {
            info!("TCP listening on {}", addr);
        }
        for addr in &udp_addrs {
            info!("UDP listening on {}", addr);
        }

        Ok(NetworkHandle {
            tcp_addrs,
            udp_addrs,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    async fn run(self, handler: Arc<dyn MessageHandler>, shutdown: oneshot::Receiver<()>) {
        let max = self.max_message_bytes;

        for listener in self.tcp {
            match TcpListener::from_std(listener) {
                Ok(listener) => {
                    tokio::spawn(accept_loop(listener, Arc::clone(&handler), max));
                }
                Err(e) => error!("Failed to register TCP listener: {}", e),
            }
        }
        for socket in self.udp {
            // Replies are sent from worker threads through a plain clone
            let replies = match socket.try_clone() {
                Ok(replies) => Arc::new(replies),
                Err(e) => {
                    error!("Failed to clone UDP socket: {}", e);
                    continue;
                }
            };
            match UdpSocket::from_std(socket) {
                Ok(socket) => {
                    tokio::spawn(datagram_loop(socket, replies, Arc::clone(&handler), max));
                }
                Err(e) => error!("Failed to register UDP socket: {}", e),
            }
        }

        // Either an explicit shutdown or the handle being dropped
        let _ = shutdown.await;
        info!("Network event loop stopping");
    }
}

/// Running front end. Dropping it stops the event loop.
#[derive(Debug)]
pub struct NetworkHandle {
    tcp_addrs: Vec<SocketAddr>,
    udp_addrs: Vec<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl NetworkHandle {
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    pub fn udp_addrs(&self) -> &[SocketAddr] {
        &self.udp_addrs
    }

    /// Stop the event loop and wait for its thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Network event loop panicked");
            }
        }
    }
}

impl Drop for NetworkHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TCP
// ─────────────────────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, handler: Arc<dyn MessageHandler>, max: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted TCP connection from {}", peer);
                tokio::spawn(serve_stream(stream, peer, Arc::clone(&handler), max));
            }
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_stream(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    max: usize,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

    // Writer half lives until every clone of the connection is gone
    tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
    });

    let connection: Arc<dyn Connection> = Arc::new(TcpConnection::new(peer, outbound_tx));
    let mut framer = LineFramer::new(max);

    loop {
        match reader.read_buf(framer.buffer_mut()).await {
            Ok(0) => break,
            Ok(_) => {
                while let Some(frame) = framer.next_frame() {
                    match frame {
                        Frame::Message(message) => {
                            handler.on_message(Arc::clone(&connection), message)
                        }
                        Frame::TooLarge(len) => {
                            warn!("Dropped {} byte message from {}", len, peer);
                            if let Err(e) = connection.send(&too_large(len, max)) {
                                debug!("Reply to {} failed: {}", peer, e);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                debug!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    debug!("TCP connection from {} closed", peer);
}

fn too_large(len: usize, max: usize) -> Vec<u8> {
    serde_json::json!({
        "status": "error",
        "message": format!("Message of {} bytes exceeds the {} byte limit", len, max),
    })
    .to_string()
    .into_bytes()
}

// ─────────────────────────────────────────────────────────────────────────────
// UDP
// ─────────────────────────────────────────────────────────────────────────────

async fn datagram_loop(
    socket: UdpSocket,
    replies: Arc<std::net::UdpSocket>,
    handler: Arc<dyn MessageHandler>,
    max: usize,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // Includes ICMP port-unreachable reports on some platforms
                debug!("UDP receive failed: {}", e);
                continue;
            }
        };

        let message = trim(&buf[..len]);
        if message.is_empty() {
            continue;
        }

        let connection: Arc<dyn Connection> =
            Arc::new(UdpConnection::new(Arc::clone(&replies), peer));
        if message.len() > max {
            warn!("Dropped {} byte datagram from {}", message.len(), peer);
            if let Err(e) = connection.send(&too_large(message.len(), max)) {
                debug!("Reply to {} failed: {}", peer, e);
            }
            continue;
        }
        handler.on_message(connection, Bytes::copy_from_slice(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandRegistry, CommandRouter, register_builtins};
    use crate::pool::WorkerPool;
    use std::io::{BufRead, BufReader, Write};

    fn start_gateway() -> NetworkHandle {
        let registry = Arc::new(CommandRegistry::default());
        register_builtins(&registry);
        let router = CommandRouter::new(registry, WorkerPool::with_name("net-test", 2).unwrap());

        let mut server = NetworkServer::new(1024);
        server.bind_tcp("127.0.0.1:0").unwrap();
        server.bind_udp("127.0.0.1:0").unwrap();
        server.start(Arc::new(router)).unwrap()
    }

    fn tcp_client(handle: &NetworkHandle) -> (std::net::TcpStream, BufReader<std::net::TcpStream>) {
        let stream = std::net::TcpStream::connect(handle.tcp_addrs()[0]).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn read_json(reader: &mut BufReader<std::net::TcpStream>) -> serde_json::Value {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.ends_with('\n'));
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_tcp_missing_data_gets_error() {
        let handle = start_gateway();
        let (mut stream, mut reader) = tcp_client(&handle);

        stream.write_all(b"{\"command\":\"X\"}\n").unwrap();
        let response = read_json(&mut reader);
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn test_tcp_round_trip_and_pipelining() {
        let handle = start_gateway();
        let (mut stream, mut reader) = tcp_client(&handle);

        stream
            .write_all(b"{\"command\":\"Register Company\",\"data\":{\"company_name\":\"acme\",\"company_id\":\"1\"}}\n")
            .unwrap();
        let response = read_json(&mut reader);
        assert_eq!(response["status"], "success");
        assert_eq!(response["command"], "Register Company");

        // No trailing newline still gets answered
        stream.write_all(b"{\"command\":\"Nope\",\"data\":{}}").unwrap();
        let response = read_json(&mut reader);
        assert_eq!(response["message"], "Unknown command: 'Nope'");
    }

    #[test]
    fn test_tcp_oversized_message() {
        let handle = start_gateway();
        let (mut stream, mut reader) = tcp_client(&handle);

        let mut big = vec![b'x'; 2048];
        big.push(b'\n');
        stream.write_all(&big).unwrap();
        let response = read_json(&mut reader);
        assert_eq!(response["status"], "error");
        assert!(response["message"].as_str().unwrap().contains("2048"));
    }

    #[test]
    fn test_tcp_oversized_line_gets_one_reply() {
        let handle = start_gateway();
        let (mut stream, mut reader) = tcp_client(&handle);

        let padding = "x".repeat(6000);
        let big = format!(
            "{{\"command\":\"Nope\",\"data\":{{\"padding\":\"{}\",\"tail\":{{}}}}}}\n",
            padding
        );
        stream.write_all(big.as_bytes()).unwrap();
        stream.write_all(b"{\"command\":\"Ping\",\"data\":{}}\n").unwrap();

        let response = read_json(&mut reader);
        assert_eq!(response["status"], "error");
        assert!(response["message"].as_str().unwrap().contains("byte limit"));

        // The next reply belongs to the follow-up message
        let response = read_json(&mut reader);
        assert_eq!(response["message"], "Unknown command: 'Ping'");
    }

    #[test]
    fn test_udp_datagram_round_trip() {
        let handle = start_gateway();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        client
            .send_to(b"{\"command\":\"Nope\",\"data\":{}}", handle.udp_addrs()[0])
            .unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(buf[len - 1], b'\n');
        let response: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(response["status"], "error");
        assert_eq!(response["command"], "Nope");
    }

    #[test]
    fn test_shutdown_stops_accepting() {
        let handle = start_gateway();
        let addr = handle.tcp_addrs()[0];
        handle.shutdown();

        let refused = std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(500));
        assert!(refused.is_err());
    }
}
