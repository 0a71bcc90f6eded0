//! TCP peer transport.
//!
//! One TCP connection per remote daemon, shared by every local client
//! talking to that daemon's services. Multiplexing works by tagging the
//! high 16 bits of the RequestID with the local client identifier on
//! outbound requests; the peer mirrors the RequestID into its reply, so
//! the tag routes the reply back and is cleared before the client sees it.
//!
//! Each peer carries a service namespace mapping service to instance
//! identifiers, learned from the peer's SD offers: the instance is not on
//! the wire, so inbound frames are stamped from this map.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::{FlushOutcome, FrameProgress, FrameReader, StreamConnection};
use crate::net::{TcpListener, TcpStream};
use crate::runtime::Command;
use crate::wire::{self, Message};
use crate::{ClientIdentifier, InstanceId, ServiceId};

// ============================================================================
// LISTENER SETUP
// ============================================================================

/// Bind the server listener, probing consecutive ports starting at
/// `base_port`. Lets several daemons coexist on one host.
pub async fn bind_with_probing<L: TcpListener>(
    ip: IpAddr,
    base_port: u16,
    attempts: u16,
) -> crate::Result<L> {
    for i in 0..attempts {
        let Some(port) = base_port.checked_add(i) else {
            break;
        };
        match L::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => {
                tracing::info!(port, "TCP server listening");
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "port in use, probing next");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(crate::Error::config(format!(
        "no free TCP port in {base_port}..{}",
        base_port.saturating_add(attempts)
    )))
}

// ============================================================================
// FRAME TRANSLATION
// ============================================================================

/// Encode a message for a peer connection. Requests expecting an answer get
/// the originating client tagged into the RequestID so the reply can be
/// routed back.
pub fn encode_for_peer(message: &Message) -> Bytes {
    let mut message = message.clone();
    if message.header.is_request_with_return() {
        if let Some(client) = message.client_identifier {
            message.header.request_id =
                wire::tag_client_identifier(message.header.request_id, client);
        }
    }
    message.serialize()
}

/// Fix up a frame read from a peer connection: replies have their client
/// tag extracted and cleared, and every frame is stamped with the instance
/// the peer's namespace maps its service to.
pub fn decode_from_peer(
    mut message: Message,
    instances: &HashMap<ServiceId, InstanceId>,
) -> Message {
    if message.header.is_reply() {
        message.client_identifier =
            Some(wire::extract_client_identifier(message.header.request_id));
        message.header.request_id = wire::clear_client_identifier(message.header.request_id);
    }
    message.instance_id = instances
        .get(&message.header.service_id)
        .copied()
        .unwrap_or(0);
    message
}

// ============================================================================
// PEER BOOKKEEPING
// ============================================================================

/// One connected remote daemon.
pub struct TcpPeer {
    pub client: ClientIdentifier,
    outbound: mpsc::UnboundedSender<Bytes>,
    /// Service namespace learned from this peer's offers.
    instances: HashMap<ServiceId, InstanceId>,
}

impl TcpPeer {
    pub fn record_instance(&mut self, service_id: ServiceId, instance_id: InstanceId) {
        self.instances.insert(service_id, instance_id);
    }

    pub fn instances(&self) -> &HashMap<ServiceId, InstanceId> {
        &self.instances
    }

    /// Hand bytes to the peer's connection task. A send error means the
    /// task is gone; the disconnect command it sent will clean up.
    pub fn send(&self, bytes: Bytes) {
        if self.outbound.send(bytes).is_err() {
            tracing::debug!(client = self.client, "peer connection already closed");
        }
    }
}

/// All connected peers, addressable by socket address or by the client
/// identifier the dispatcher knows them under.
#[derive(Default)]
pub struct TcpManager {
    peers: HashMap<SocketAddr, TcpPeer>,
    by_client: HashMap<ClientIdentifier, SocketAddr>,
}

impl TcpManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        addr: SocketAddr,
        client: ClientIdentifier,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) {
        self.by_client.insert(client, addr);
        self.peers.insert(
            addr,
            TcpPeer {
                client,
                outbound,
                instances: HashMap::new(),
            },
        );
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&TcpPeer> {
        self.peers.get(addr)
    }

    pub fn peer_mut(&mut self, addr: &SocketAddr) -> Option<&mut TcpPeer> {
        self.peers.get_mut(addr)
    }

    pub fn peer_by_client(&self, client: ClientIdentifier) -> Option<&TcpPeer> {
        self.by_client.get(&client).and_then(|a| self.peers.get(a))
    }

    pub fn peer_mut_by_client(&mut self, client: ClientIdentifier) -> Option<&mut TcpPeer> {
        let addr = self.by_client.get(&client)?;
        self.peers.get_mut(addr)
    }

    pub fn remove_by_client(&mut self, client: ClientIdentifier) {
        if let Some(addr) = self.by_client.remove(&client) {
            self.peers.remove(&addr);
        }
    }

    /// Clients of every peer on the given address, for reboot teardown.
    /// Dropping their senders makes the connection tasks exit.
    pub fn clients_with_ip(&self, ip: IpAddr) -> Vec<ClientIdentifier> {
        self.peers
            .iter()
            .filter(|(addr, _)| addr.ip() == ip)
            .map(|(_, peer)| peer.client)
            .collect()
    }
}

// ============================================================================
// CONNECTION TASK
// ============================================================================

/// Drives one peer connection until it closes: inbound frames become
/// [`Command::PeerFrame`], outbound bytes come in over the channel, and
/// congestion suspends ingress until the pending queue drains.
pub async fn peer_task<T: TcpStream>(
    stream: T,
    client: ClientIdentifier,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    commands: mpsc::UnboundedSender<Command>,
) {
    if let Err(e) = run_peer(stream, client, outbound, &commands).await {
        tracing::warn!(client, error = %e, "peer connection failed");
    }
    let _ = commands.send(Command::Disconnected { client });
}

async fn run_peer<T: TcpStream>(
    stream: T,
    client: ClientIdentifier,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    commands: &mpsc::UnboundedSender<Command>,
) -> crate::Result<()> {
    let mut conn = StreamConnection::new(stream);
    let mut frames = FrameReader::new();

    loop {
        if conn.is_congested() {
            // Ingress stays suspended until the pending queue drains
            tokio::select! {
                ready = conn.writable() => {
                    ready?;
                    if conn.write_pending()? == FlushOutcome::CongestionFinished {
                        tracing::debug!(client, "peer connection congestion over");
                    }
                }
                maybe = outbound.recv() => match maybe {
                    Some(bytes) => { conn.write_non_blocking(&bytes)?; }
                    None => return Ok(()),
                },
            }
        } else {
            tokio::select! {
                ready = conn.readable() => {
                    ready?;
                    loop {
                        match frames.read(conn.stream())? {
                            FrameProgress::Frame(message) => {
                                if commands
                                    .send(Command::PeerFrame { client, message })
                                    .is_err()
                                {
                                    return Ok(());
                                }
                            }
                            FrameProgress::NeedMore => break,
                            FrameProgress::Closed => return Ok(()),
                        }
                    }
                }
                maybe = outbound.recv() => match maybe {
                    Some(bytes) => { conn.write_non_blocking(&bytes)?; }
                    None => return Ok(()),
                },
            }
        }
    }
}
