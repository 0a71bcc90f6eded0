//! The event loop.
//!
//! One task owns all mutable state: the [`Dispatcher`], the peer pool, the
//! local client channels, SD sessions and reboot history. Per-connection
//! tasks only move bytes; they feed decoded frames back over an `mpsc`
//! channel as [`Command`] values. Handlers mutate state and collect
//! [`Action`] values, which the loop executes afterwards, so no routing
//! decision ever blocks on a socket.
//!
//! Sockets are abstracted by the traits in [`crate::net`]; [`Runtime::run`]
//! plugs in the tokio implementations.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::activation::ServiceActivator;
use crate::config::DispatcherConfig;
use crate::dispatcher::{Action, ClientKind, Dispatcher};
use crate::ipc::IpcMessage;
use crate::local;
use crate::net::{self, LocalListener, TcpListener, TcpStream, UdpSocket};
use crate::sd::{self, RebootTable, SdChannel, SdEvent, SdSessions, ServiceAnnouncer};
use crate::tcp::{self, TcpManager};
use crate::wire::{Message, SdEntry, SdMessage, SD_MESSAGE_ID};
use crate::{ClientIdentifier, ServiceIdentity};

// ============================================================================
// COMMANDS
// ============================================================================

/// What connection tasks report back to the event loop.
#[derive(Debug)]
pub enum Command {
    /// A SOME/IP frame arrived on a peer connection.
    PeerFrame {
        client: ClientIdentifier,
        message: Message,
    },
    /// An IPC frame arrived on a local connection.
    IpcFrame {
        client: ClientIdentifier,
        message: IpcMessage,
    },
    /// The connection is gone (closed, failed, or torn down).
    Disconnected { client: ClientIdentifier },
}

// ============================================================================
// RUNTIME
// ============================================================================

/// The dispatcher daemon. Construct with a config, optionally attach an
/// activator, then [`run`](Runtime::run).
pub struct Runtime {
    config: DispatcherConfig,
    activator: Option<Box<dyn ServiceActivator>>,
}

impl Runtime {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            activator: None,
        }
    }

    /// Attach an on-demand activation hook.
    pub fn with_activator(mut self, activator: Box<dyn ServiceActivator>) -> Self {
        self.activator = Some(activator);
        self
    }

    /// Bind the tokio sockets and run forever. Only startup can fail;
    /// individual connections failing is routine and handled inside.
    pub async fn run(self) -> crate::Result<()> {
        self.run_with::<tokio::net::UdpSocket, tokio::net::TcpListener, tokio::net::UnixListener>()
            .await
    }

    /// Run against explicit socket implementations.
    pub async fn run_with<U, L, X>(self) -> crate::Result<()>
    where
        U: UdpSocket,
        L: TcpListener,
        X: LocalListener,
    {
        self.config.validate()?;

        // A stale socket file from a previous run would make bind fail
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => tracing::debug!(path = %self.config.socket_path.display(),
                "removed stale socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let local_listener = X::bind(&self.config.socket_path)?;

        let tcp_listener: L = tcp::bind_with_probing(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.tcp_port,
            self.config.tcp_port_attempts,
        )
        .await?;
        let tcp_port = tcp_listener.local_addr()?.port();

        let sd_socket = U::bind_broadcast(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.sd_port,
        ))?;
        tracing::info!(
            socket = %self.config.socket_path.display(),
            tcp_port,
            sd_port = self.config.sd_port,
            "dispatcher up"
        );

        let endpoint = SocketAddrV4::new(self.config.announced_address, tcp_port);
        let mut state = State {
            dispatcher: Dispatcher::new(),
            tcp: TcpManager::new(),
            locals: HashMap::new(),
            pending_connects: HashMap::new(),
            sessions: SdSessions::new(),
            reboots: RebootTable::new(),
            announcer: ServiceAnnouncer::new(endpoint, self.config.service_ttl),
            activator: self.activator,
            config: self.config,
        };
        state
            .dispatcher
            .add_registration_listener(Box::new(ServiceAnnouncer::new(
                endpoint,
                state.config.service_ttl,
            )));

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (connect_tx, mut connect_rx) =
            mpsc::unbounded_channel::<(SocketAddr, io::Result<L::Stream>)>();

        let mut ping = tokio::time::interval(state.config.ping_interval);
        let mut announce = tokio::time::interval(state.config.announce_interval);
        let mut sd_buf = vec![0u8; 1500];

        loop {
            tokio::select! {
                accepted = local_listener.accept() => match accepted {
                    Ok(stream) => state.on_local_accept::<X>(stream, &cmd_tx),
                    Err(e) => tracing::warn!(error = %e, "local accept failed"),
                },

                accepted = tcp_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        state.on_peer_connected::<U, L>(stream, addr, &cmd_tx, &sd_socket).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "TCP accept failed"),
                },

                received = sd_socket.recv_from(&mut sd_buf) => match received {
                    Ok((len, from)) => {
                        let datagram = sd_buf[..len].to_vec();
                        state.on_sd_datagram::<U, L>(&datagram, from, &connect_tx, &sd_socket).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "SD receive failed"),
                },

                Some((addr, result)) = connect_rx.recv() => {
                    state.on_connect_result::<U, L>(addr, result, &cmd_tx, &sd_socket).await;
                }

                Some(command) = cmd_rx.recv() => {
                    state.on_command::<U, L>(command, &connect_tx, &sd_socket).await;
                }

                _ = ping.tick() => state.on_ping_tick(),

                _ = announce.tick() => state.on_announce_tick(&sd_socket).await,
            }
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

struct State {
    dispatcher: Dispatcher,
    tcp: TcpManager,
    locals: HashMap<ClientIdentifier, mpsc::UnboundedSender<Bytes>>,
    /// Identities waiting for an outbound connect to finish, per endpoint.
    pending_connects: HashMap<SocketAddr, Vec<ServiceIdentity>>,
    sessions: SdSessions,
    reboots: RebootTable,
    /// Builder for timer-driven and unicast announcements (the listener
    /// registered on the dispatcher handles the event-driven ones).
    announcer: ServiceAnnouncer,
    activator: Option<Box<dyn ServiceActivator>>,
    config: DispatcherConfig,
}

impl State {
    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn on_local_accept<X: LocalListener>(
        &mut self,
        stream: X::Stream,
        cmd_tx: &mpsc::UnboundedSender<Command>,
    ) {
        let client = self.dispatcher.on_new_client(ClientKind::Local);
        let (tx, rx) = mpsc::unbounded_channel();
        // The registry push must be the first frame the client sees
        let _ = tx.send(local::registry_push(&self.dispatcher));
        self.locals.insert(client, tx);
        tokio::spawn(local::local_client_task(stream, client, rx, cmd_tx.clone()));
    }

    async fn on_peer_connected<U: UdpSocket, L: TcpListener>(
        &mut self,
        stream: L::Stream,
        addr: SocketAddr,
        cmd_tx: &mpsc::UnboundedSender<Command>,
        udp: &U,
    ) {
        let client = self.dispatcher.on_new_client(ClientKind::Remote(addr));
        let (tx, rx) = mpsc::unbounded_channel();
        self.tcp.insert(addr, client, tx);
        tokio::spawn(tcp::peer_task(stream, client, rx, cmd_tx.clone()));

        // Register anything that was waiting for this connect
        if let Some(identities) = self.pending_connects.remove(&addr) {
            let mut actions = Vec::new();
            for identity in identities {
                self.register_remote(identity, addr, &mut actions);
            }
            self.execute_actions(actions, udp).await;
        }
    }

    async fn on_connect_result<U: UdpSocket, L: TcpListener>(
        &mut self,
        addr: SocketAddr,
        result: io::Result<L::Stream>,
        cmd_tx: &mpsc::UnboundedSender<Command>,
        udp: &U,
    ) {
        match result {
            Ok(stream) => {
                self.on_peer_connected::<U, L>(stream, addr, cmd_tx, udp).await;
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "connect to peer failed");
                self.pending_connects.remove(&addr);
            }
        }
    }

    fn register_remote(
        &mut self,
        identity: ServiceIdentity,
        addr: SocketAddr,
        actions: &mut Vec<Action>,
    ) {
        let Some(peer) = self.tcp.peer_mut(&addr) else {
            tracing::warn!(%identity, peer = %addr, "offer from unconnected peer");
            return;
        };
        peer.record_instance(identity.service_id, identity.instance_id);
        let client = peer.client;
        self.dispatcher
            .try_register_service(identity, client, false, actions);
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    async fn on_command<U: UdpSocket, L: TcpListener>(
        &mut self,
        command: Command,
        connect_tx: &mpsc::UnboundedSender<(SocketAddr, io::Result<L::Stream>)>,
        udp: &U,
    ) {
        match command {
            Command::PeerFrame { client, message } => {
                let Some(ClientKind::Remote(addr)) =
                    self.dispatcher.client(client).map(|r| r.kind.clone())
                else {
                    tracing::warn!(client, "peer frame from non-peer client");
                    return;
                };
                if message.header.message_id() == SD_MESSAGE_ID {
                    // SD embedded in the TCP stream (subscriptions, mostly)
                    let session_id = (message.header.request_id & 0xFFFF) as u16;
                    let Some(sd_message) =
                        SdMessage::parse_payload(&mut message.payload.as_ref(), session_id)
                    else {
                        tracing::warn!(client, "malformed embedded SD message");
                        return;
                    };
                    let mut events = Vec::new();
                    sd::handle_sd_message(
                        &sd_message,
                        addr,
                        SdChannel::Unicast,
                        &mut self.reboots,
                        &mut events,
                    );
                    self.process_sd_events::<U, L>(events, Some(client), connect_tx, udp)
                        .await;
                } else {
                    let message = match self.tcp.peer_by_client(client) {
                        Some(peer) => tcp::decode_from_peer(message, peer.instances()),
                        None => message,
                    };
                    let mut actions = Vec::new();
                    self.dispatcher.dispatch_message(message, client, &mut actions);
                    self.execute_actions(actions, udp).await;
                }
            }
            Command::IpcFrame { client, message } => {
                let mut actions = Vec::new();
                let answer = local::handle_ipc_message(
                    &message,
                    client,
                    &mut self.dispatcher,
                    &mut actions,
                );
                if let Some(answer) = answer {
                    self.send_to_local(client, answer.encode());
                }
                self.execute_actions(actions, udp).await;
            }
            Command::Disconnected { client } => {
                let mut actions = Vec::new();
                self.dispatcher.on_client_disconnected(client, &mut actions);
                self.locals.remove(&client);
                self.tcp.remove_by_client(client);
                self.execute_actions(actions, udp).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Service discovery
    // ------------------------------------------------------------------

    async fn on_sd_datagram<U: UdpSocket, L: TcpListener>(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        connect_tx: &mpsc::UnboundedSender<(SocketAddr, io::Result<L::Stream>)>,
        udp: &U,
    ) {
        // Our own broadcasts come back to us; drop them
        if from.ip() == IpAddr::V4(self.config.announced_address) {
            return;
        }
        let Some(message) = SdMessage::parse_datagram(datagram) else {
            tracing::debug!(peer = %from, "ignoring non-SD datagram");
            return;
        };
        let channel = if message.is_unicast() {
            SdChannel::Unicast
        } else {
            SdChannel::Multicast
        };
        let mut events = Vec::new();
        sd::handle_sd_message(&message, from, channel, &mut self.reboots, &mut events);
        self.process_sd_events::<U, L>(events, None, connect_tx, udp).await;
    }

    /// Apply SD events. `via_client` is set when the events arrived on an
    /// established peer connection rather than by UDP.
    async fn process_sd_events<U: UdpSocket, L: TcpListener>(
        &mut self,
        events: Vec<SdEvent>,
        via_client: Option<ClientIdentifier>,
        connect_tx: &mpsc::UnboundedSender<(SocketAddr, io::Result<L::Stream>)>,
        udp: &U,
    ) {
        let mut actions = Vec::new();
        for event in events {
            match event {
                SdEvent::RemoteOffer { identity, endpoint } => {
                    let addr = SocketAddr::V4(endpoint);
                    if self.tcp.peer(&addr).is_some() {
                        self.register_remote(identity, addr, &mut actions);
                    } else {
                        let pending = self.pending_connects.entry(addr).or_default();
                        let connect_needed = pending.is_empty();
                        if !pending.contains(&identity) {
                            pending.push(identity);
                        }
                        if connect_needed {
                            let connect_tx = connect_tx.clone();
                            tokio::spawn(async move {
                                let result = <L::Stream as TcpStream>::connect(addr).await;
                                let _ = connect_tx.send((addr, result));
                            });
                        }
                    }
                }
                SdEvent::RemoteWithdraw { identity } => {
                    let is_remote = self
                        .dispatcher
                        .service(identity)
                        .map(|s| !s.is_local)
                        .unwrap_or(false);
                    if is_remote {
                        self.dispatcher.unregister_service(identity, &mut actions);
                    }
                }
                SdEvent::RemoteFind {
                    service_id,
                    instance_id,
                    from,
                } => {
                    let matching: Vec<ServiceIdentity> = self
                        .dispatcher
                        .local_service_list()
                        .into_iter()
                        .filter(|s| {
                            s.service_id == service_id
                                && (instance_id == 0xFFFF || s.instance_id == instance_id)
                        })
                        .collect();
                    if !matching.is_empty() {
                        let mut reply = self.announcer.build_announcement(&matching);
                        self.sessions.stamp(&mut reply, true);
                        if let Err(e) = udp.send_to(&reply.serialize(), from).await {
                            tracing::warn!(peer = %from, error = %e, "find reply failed");
                        }
                    }
                }
                SdEvent::RemoteSubscribe { member, from } => {
                    let subscriber = via_client
                        .or_else(|| self.tcp.clients_with_ip(from.ip()).first().copied());
                    let Some(subscriber) = subscriber else {
                        tracing::warn!(%member, peer = %from, "subscribe from unconnected peer");
                        continue;
                    };
                    self.dispatcher
                        .subscribe_notification(subscriber, member, &mut actions);
                    self.send_subscribe_ack(member, from, udp).await;
                }
                SdEvent::RemoteUnsubscribe { member, from } => {
                    let subscriber = via_client
                        .or_else(|| self.tcp.clients_with_ip(from.ip()).first().copied());
                    if let Some(subscriber) = subscriber {
                        self.dispatcher.unsubscribe_notification(subscriber, member);
                    }
                }
                SdEvent::PeerRebooted { peer } => {
                    // Unregister synchronously: fresh offers in this same
                    // datagram must be able to rebind before the dropped
                    // tasks report their Disconnected commands
                    for client in self.tcp.clients_with_ip(peer) {
                        tracing::info!(client, %peer, "tearing down connection to rebooted peer");
                        self.dispatcher.on_client_disconnected(client, &mut actions);
                        self.tcp.remove_by_client(client);
                    }
                    self.pending_connects.retain(|addr, _| addr.ip() != peer);
                }
            }
        }
        self.execute_actions(actions, udp).await;
    }

    async fn send_subscribe_ack<U: UdpSocket>(
        &mut self,
        member: crate::MemberIdentity,
        to: SocketAddr,
        udp: &U,
    ) {
        let mut ack = SdMessage::new();
        ack.add_entry(SdEntry::subscribe_ack(
            member.service_id,
            member.instance_id,
            member.member_id,
            self.config.service_ttl,
        ));
        self.sessions.stamp(&mut ack, true);
        if let Err(e) = udp.send_to(&ack.serialize(), to).await {
            tracing::warn!(peer = %to, error = %e, "subscribe ack failed");
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn on_ping_tick(&mut self) {
        let frame = local::ping_frame();
        for client in self.dispatcher.connected_local_clients() {
            self.send_to_local(client, frame.clone());
        }
    }

    async fn on_announce_tick<U: UdpSocket>(&mut self, udp: &U) {
        let identities = self.dispatcher.local_service_list();
        if identities.is_empty() {
            return;
        }
        let mut message = self.announcer.build_announcement(&identities);
        self.sessions.stamp(&mut message, false);
        let target = net::broadcast_target(self.config.sd_port);
        if let Err(e) = udp.send_to(&message.serialize(), target).await {
            tracing::warn!(error = %e, "SD announcement failed");
        }
    }

    // ------------------------------------------------------------------
    // Action execution
    // ------------------------------------------------------------------

    fn send_to_local(&self, client: ClientIdentifier, bytes: Bytes) {
        if let Some(tx) = self.locals.get(&client) {
            if tx.send(bytes).is_err() {
                tracing::debug!(client, "local connection already closed");
            }
        }
    }

    async fn execute_actions<U: UdpSocket>(&mut self, actions: Vec<Action>, udp: &U) {
        for action in actions {
            match action {
                Action::Deliver { target, message } => {
                    match self.dispatcher.client(target).map(|r| r.kind.clone()) {
                        Some(ClientKind::Local) => {
                            let frame = IpcMessage::new(
                                crate::ipc::IpcKind::SendMessage,
                                crate::ipc::encode_message_body(&message),
                            );
                            self.send_to_local(target, frame.encode());
                        }
                        Some(ClientKind::Remote(_)) => {
                            if let Some(peer) = self.tcp.peer_by_client(target) {
                                peer.send(tcp::encode_for_peer(&message));
                            } else {
                                tracing::warn!(client = target, "delivery to unknown peer");
                            }
                        }
                        None => tracing::warn!(client = target, "delivery to unknown client"),
                    }
                }
                Action::SubscriptionActive { provider, member } => {
                    match self.dispatcher.client(provider).map(|r| r.kind.clone()) {
                        Some(ClientKind::Remote(_)) => {
                            // Relay the subscription upstream, embedded in
                            // the TCP stream
                            let mut subscribe =
                                sd::build_subscribe_message(member, self.config.service_ttl);
                            self.sessions.stamp(&mut subscribe, true);
                            if let Some(peer) = self.tcp.peer_by_client(provider) {
                                peer.send(subscribe.serialize());
                            }
                        }
                        Some(ClientKind::Local) => {
                            tracing::debug!(provider, %member, "subscription active");
                        }
                        None => {}
                    }
                }
                Action::SendSdBroadcast { mut message } => {
                    self.sessions.stamp(&mut message, false);
                    let target = net::broadcast_target(self.config.sd_port);
                    if let Err(e) = udp.send_to(&message.serialize(), target).await {
                        tracing::warn!(error = %e, "SD broadcast failed");
                    }
                }
                Action::RegistryChanged {
                    identity,
                    registered,
                    owner,
                } => {
                    if registered {
                        if let Some(activator) = self.activator.as_mut() {
                            activator.service_registered(identity);
                        }
                    }
                    let kind = if registered {
                        crate::ipc::IpcKind::ServicesRegistered
                    } else {
                        crate::ipc::IpcKind::ServicesUnregistered
                    };
                    let frame =
                        IpcMessage::new(kind, crate::ipc::encode_identity_list(&[identity]))
                            .encode();
                    for client in self.dispatcher.connected_local_clients() {
                        if client != owner {
                            self.send_to_local(client, frame.clone());
                        }
                    }
                }
                Action::RequestActivation { identity } => {
                    if let Some(activator) = self.activator.as_mut() {
                        if let Err(e) = activator.activate(identity) {
                            tracing::warn!(%identity, error = %e, "activation failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StreamSocket;
    use std::future::Future;

    struct NullUdp;

    impl UdpSocket for NullUdp {
        fn bind_broadcast(_addr: SocketAddr) -> io::Result<Self> {
            Ok(NullUdp)
        }

        fn send_to(
            &self,
            buf: &[u8],
            _target: SocketAddr,
        ) -> impl Future<Output = io::Result<usize>> + Send {
            std::future::ready(Ok(buf.len()))
        }

        fn recv_from(
            &self,
            _buf: &mut [u8],
        ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
            std::future::pending()
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("0.0.0.0:0".parse().unwrap())
        }
    }

    struct NullStream;

    impl StreamSocket for NullStream {
        fn try_read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn readable(&self) -> impl Future<Output = io::Result<()>> + Send {
            std::future::pending()
        }

        fn writable(&self) -> impl Future<Output = io::Result<()>> + Send {
            std::future::pending()
        }
    }

    impl TcpStream for NullStream {
        fn connect(_addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send {
            std::future::ready(Err(io::ErrorKind::ConnectionRefused.into()))
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("0.0.0.0:0".parse().unwrap())
        }
    }

    struct NullListener;

    impl TcpListener for NullListener {
        type Stream = NullStream;

        fn bind(_addr: SocketAddr) -> impl Future<Output = io::Result<Self>> + Send {
            std::future::ready(Ok(NullListener))
        }

        fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send {
            std::future::pending()
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("0.0.0.0:0".parse().unwrap())
        }
    }

    fn test_state() -> State {
        let config = DispatcherConfig::default();
        let endpoint = SocketAddrV4::new(config.announced_address, config.tcp_port);
        State {
            dispatcher: Dispatcher::new(),
            tcp: TcpManager::new(),
            locals: HashMap::new(),
            pending_connects: HashMap::new(),
            sessions: SdSessions::new(),
            reboots: RebootTable::new(),
            announcer: ServiceAnnouncer::new(endpoint, config.service_ttl),
            activator: None,
            config,
        }
    }

    /// A rebooted peer's fresh offers can arrive in the same datagram that
    /// triggered the reboot detection, before the dropped connection tasks
    /// report back. The old registrations must already be gone by then.
    #[tokio::test]
    async fn reboot_frees_registrations_for_fresh_offers() {
        let mut state = test_state();
        let addr: SocketAddr = "10.0.0.2:10032".parse().unwrap();
        let identity = ServiceIdentity::new(0x1234, 1);

        let (tx, _rx) = mpsc::unbounded_channel();
        let old = state.dispatcher.on_new_client(ClientKind::Remote(addr));
        state.tcp.insert(addr, old, tx);
        let mut actions = Vec::new();
        state.register_remote(identity, addr, &mut actions);
        assert!(state.dispatcher.service(identity).is_some());

        let (connect_tx, _connect_rx) = mpsc::unbounded_channel();
        let udp = NullUdp;
        state
            .process_sd_events::<NullUdp, NullListener>(
                vec![SdEvent::PeerRebooted { peer: addr.ip() }],
                None,
                &connect_tx,
                &udp,
            )
            .await;

        // Unregistered before any Disconnected command could arrive
        assert!(state.dispatcher.service(identity).is_none());

        // The peer reconnects and its fresh offer binds immediately
        let (tx, _rx) = mpsc::unbounded_channel();
        let fresh = state.dispatcher.on_new_client(ClientKind::Remote(addr));
        state.tcp.insert(addr, fresh, tx);
        let mut actions = Vec::new();
        state.register_remote(identity, addr, &mut actions);
        assert_eq!(
            state.dispatcher.service(identity).and_then(|s| s.client),
            Some(fresh)
        );
    }
}
