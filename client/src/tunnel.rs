//! Guardian tunnel
//!
//! A single-peer transport endpoint. In UDP mode `open` binds a socket and
//! starts one listener task that decodes inbound JSON packets and publishes
//! them as [`TunnelEvent`]s; `send_packet` fires datagrams at the configured
//! device; `close` stops the listener before releasing the socket.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};
use tunnelsnake_shared::protocol::MAX_PACKET_SIZE;
use tunnelsnake_shared::{Error, Mode, Result};

/// Relay host stored for TCP mode (no TCP transport exists yet)
pub const DEFAULT_TCP_RELAY_HOST: &str = "localhost";

/// Relay port stored for TCP mode
pub const DEFAULT_TCP_RELAY_PORT: u16 = 8080;

/// How long `open` waits for the listener to report it is running
pub const LISTENER_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `close` waits for the listener to exit before aborting it
pub const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A decoded packet received from the network
#[derive(Debug, Clone, Serialize)]
pub struct ReceivedPacket {
    pub from: SocketAddr,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Notifications published by the listener
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A datagram carrying valid JSON
    Packet(ReceivedPacket),
    /// A datagram that could not be decoded; the listener keeps running
    Malformed {
        from: SocketAddr,
        len: usize,
        reason: String,
    },
}

/// Per-mode endpoint configuration
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Udp { address: String, port: u16 },
    Tcp { relay_host: String, relay_port: u16 },
    Serial,
}

/// Socket and the listener bound to it. Kept together so one never
/// exists without the other.
struct OpenSocket {
    socket: Arc<UdpSocket>,
    shutdown: oneshot::Sender<()>,
    listener: JoinHandle<()>,
}

/// Single-peer tunnel to a Guardian device
pub struct Tunnel {
    endpoint: Endpoint,
    bind_port: Option<u16>,
    open: Option<OpenSocket>,
    events: broadcast::Sender<TunnelEvent>,
}

impl Tunnel {
    /// Configure a tunnel. UDP mode requires both address and port.
    pub fn new(mode: Mode, address: Option<&str>, port: Option<u16>) -> Result<Self> {
        let endpoint = match mode {
            Mode::Udp => {
                let address = match address.map(str::trim) {
                    Some(a) if !a.is_empty() => a.to_string(),
                    _ => {
                        error!("UDP configuration error: no device address");
                        return Err(Error::Configuration("device address is required".into()));
                    }
                };
                let port = match port {
                    Some(port) if port != 0 => port,
                    Some(_) => {
                        error!("UDP configuration error: device port 0");
                        return Err(Error::Configuration("device port cannot be 0".into()));
                    }
                    None => {
                        error!("UDP configuration error: no device port");
                        return Err(Error::Configuration("device port is required".into()));
                    }
                };
                Endpoint::Udp { address, port }
            }
            Mode::Tcp => Endpoint::Tcp {
                relay_host: DEFAULT_TCP_RELAY_HOST.to_string(),
                relay_port: DEFAULT_TCP_RELAY_PORT,
            },
            Mode::Serial => Endpoint::Serial,
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            endpoint,
            bind_port: None,
            open: None,
            events,
        })
    }

    /// Bind a different local port than the device port (0 = ephemeral)
    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    pub fn mode(&self) -> Mode {
        match self.endpoint {
            Endpoint::Udp { .. } => Mode::Udp,
            Endpoint::Tcp { .. } => Mode::Tcp,
            Endpoint::Serial => Mode::Serial,
        }
    }

    /// Configured device address and port (UDP only)
    pub fn peer(&self) -> Option<(&str, u16)> {
        match &self.endpoint {
            Endpoint::Udp { address, port } => Some((address.as_str(), *port)),
            _ => None,
        }
    }

    /// Relay stored for TCP mode
    pub fn tcp_relay(&self) -> Option<(&str, u16)> {
        match &self.endpoint {
            Endpoint::Tcp { relay_host, relay_port } => Some((relay_host.as_str(), *relay_port)),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// True while the listener task is running
    pub fn is_listening(&self) -> bool {
        self.open
            .as_ref()
            .map(|open| !open.listener.is_finished())
            .unwrap_or(false)
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let open = self.open.as_ref().ok_or(Error::NotOpen)?;
        Ok(open.socket.local_addr()?)
    }

    /// Subscribe to packets surfaced by the listener
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Bind the socket and start the listener.
    ///
    /// Returns once the listener has signalled it is running.
    pub async fn open(&mut self) -> Result<()> {
        let (address, port) = self.udp_endpoint()?;
        if self.open.is_some() {
            warn!("UDP tunnel to {}:{} is already open", address, port);
            return Err(Error::AlreadyOpen);
        }

        let bind_port = self.bind_port.unwrap_or(port);
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], bind_port)))
            .await
            .map_err(|e| {
                error!("Failed to bind UDP port {}: {}", bind_port, e);
                Error::Transport(e)
            })?;
        let socket = Arc::new(socket);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let peer = format!("{}:{}", address, port);
        let mut listener = tokio::spawn(listen(
            socket.clone(),
            peer,
            self.events.clone(),
            ready_tx,
            shutdown_rx,
        ));

        // Wait for the listener to come up
        match timeout(LISTENER_READY_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // Ready sender dropped: the task ended before reporting
                let _ = (&mut listener).await;
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::Other,
                    "listener exited during startup",
                )));
            }
            Err(_) => {
                listener.abort();
                error!("UDP listener did not start within {:?}", LISTENER_READY_TIMEOUT);
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "listener did not start in time",
                )));
            }
        }

        self.open = Some(OpenSocket {
            socket,
            shutdown: shutdown_tx,
            listener,
        });
        Ok(())
    }

    /// Send one datagram to the device. No acknowledgement is awaited.
    pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let (address, port) = self.udp_endpoint()?;

        // Socket open?
        let open = self.open.as_ref().ok_or_else(|| {
            error!("Please open the UDP socket");
            Error::NotOpen
        })?;

        // Valid packet provided?
        if packet.is_empty() {
            error!("Invalid packet provided");
            return Err(Error::InvalidPacket("packet is empty".into()));
        }

        let sent = open.socket.send_to(packet, (address, port)).await.map_err(|e| {
            error!("Failed to send packet to {}:{}: {}", address, port, e);
            Error::Transport(e)
        })?;
        debug!("Sent {} bytes to {}:{}", sent, address, port);
        Ok(())
    }

    /// Stop the listener and release the socket
    pub async fn close(&mut self) -> Result<()> {
        self.udp_endpoint()?;
        let OpenSocket {
            socket,
            shutdown,
            mut listener,
        } = self.open.take().ok_or(Error::NotOpen)?;

        // The listener may already have exited on a fatal receive error
        let _ = shutdown.send(());
        match timeout(LISTENER_SHUTDOWN_TIMEOUT, &mut listener).await {
            Ok(Ok(())) => debug!("UDP listener stopped"),
            Ok(Err(e)) => warn!("UDP listener ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "UDP listener did not stop within {:?}, aborting",
                    LISTENER_SHUTDOWN_TIMEOUT
                );
                listener.abort();
            }
        }

        drop(socket);
        info!("UDP tunnel closed");
        Ok(())
    }

    fn udp_endpoint(&self) -> Result<(&str, u16)> {
        match &self.endpoint {
            Endpoint::Udp { address, port } => Ok((address.as_str(), *port)),
            _ => {
                error!("Incorrect mode selected: {}", self.mode());
                Err(Error::UnsupportedMode(self.mode()))
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(open) = self.open.take() {
            let _ = open.shutdown.send(());
            open.listener.abort();
        }
    }
}

/// Receive loop bound to an open socket. Runs until shutdown is signalled
/// or the socket fails.
async fn listen(
    socket: Arc<UdpSocket>,
    peer: String,
    events: broadcast::Sender<TunnelEvent>,
    ready: oneshot::Sender<()>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let local = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("UDP listener started on {} for {}", local, peer);
    let _ = ready.send(());

    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("UDP listener shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        if len == buf.len() {
                            warn!(
                                "Packet from {} filled the {} byte buffer and may be truncated",
                                from, len
                            );
                        }
                        handle_datagram(&buf[..len], from, &events);
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("UDP receive error: {}", e);
                    }
                    Err(e) => {
                        error!("UDP listener stopped: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

fn handle_datagram(data: &[u8], from: SocketAddr, events: &broadcast::Sender<TunnelEvent>) {
    let event = match serde_json::from_slice::<serde_json::Value>(data) {
        Ok(payload) => {
            info!(%from, %payload, "Received packet");
            TunnelEvent::Packet(ReceivedPacket {
                from,
                payload,
                received_at: Utc::now(),
            })
        }
        Err(e) => {
            warn!("Discarding malformed packet from {} ({} bytes): {}", from, data.len(), e);
            TunnelEvent::Malformed {
                from,
                len: data.len(),
                reason: e.to_string(),
            }
        }
    };

    // No subscribers is fine
    let _ = events.send(event);
}

/// Errors reported for an earlier send (ICMP unreachable) rather than a
/// broken socket
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
