//! The routing core.
//!
//! [`Dispatcher`] owns the three registries everything else revolves
//! around:
//!
//! | Registry | Contents |
//! |----------|----------|
//! | services | Who provides which [`ServiceIdentity`], local or remote |
//! | notifications | Subscriber lists per [`MemberIdentity`], plus the provider |
//! | clients | Every connection ever seen, tombstoned after disconnect |
//!
//! All operations are synchronous against the current registry state.
//! Routing decisions are returned as [`Action`] values and executed by the
//! runtime; no queued routing state survives a call. The single-owner model
//! means none of this needs locks.
//!
//! Client identifiers are assigned monotonically and never reused, so a
//! reply that was in flight when its requester disconnected resolves to a
//! tombstone (and is dropped with a warning) instead of reaching an
//! unrelated new client.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::wire::{Message, SdMessage};
use crate::{ClientIdentifier, MemberIdentity, ServiceIdentity};

// ============================================================================
// ACTIONS
// ============================================================================

/// A routing decision for the runtime to execute.
#[derive(Debug)]
pub enum Action {
    /// Deliver a message to a client's connection.
    Deliver {
        target: ClientIdentifier,
        message: Message,
    },
    /// A notification gained its first subscriber (or a provider was bound
    /// while subscribers exist); the provider's transport may need to relay
    /// a subscription upstream.
    SubscriptionActive {
        provider: ClientIdentifier,
        member: MemberIdentity,
    },
    /// Broadcast an SD message (flags and session are stamped at send time).
    SendSdBroadcast { message: SdMessage },
    /// Push a registry delta to all connected local clients except the
    /// owner of the change.
    RegistryChanged {
        identity: ServiceIdentity,
        registered: bool,
        owner: ClientIdentifier,
    },
    /// A Request targeted an identity nobody provides; the activation hook
    /// may want to start it. The synthesized Error reply flows regardless.
    RequestActivation { identity: ServiceIdentity },
}

/// Observes service registrations. On registration, listeners run in the
/// order they were added; on unregistration, in **reverse** order. The
/// announcer relies on this: it must broadcast the withdrawal while
/// endpoint state added by later listeners is still valid.
pub trait ServiceRegistrationListener: Send {
    fn on_service_registered(&mut self, service: &Service, actions: &mut Vec<Action>);
    fn on_service_unregistered(&mut self, service: &Service, actions: &mut Vec<Action>);
}

// ============================================================================
// DATA MODEL
// ============================================================================

/// Outcome of [`Dispatcher::register_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// The exact identity is already registered; no state was changed.
    Duplicate,
}

/// A registered service.
#[derive(Debug, Clone)]
pub struct Service {
    pub identity: ServiceIdentity,
    /// Provided by a local process (true) or learned via SD (false).
    pub is_local: bool,
    /// The providing client. `None` for a local identity that was announced
    /// but whose process has not connected yet (on-demand activation).
    pub client: Option<ClientIdentifier>,
}

/// Subscription state for one member. Created lazily on first use, never
/// destroyed; an empty subscriber list is equivalent to no notification.
#[derive(Debug)]
struct Notification {
    member: MemberIdentity,
    /// In subscription order; delivery follows this order.
    subscribers: Vec<ClientIdentifier>,
    provider: Option<ServiceIdentity>,
}

/// How a client is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKind {
    Local,
    Remote(SocketAddr),
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote(addr) => write!(f, "remote {addr}"),
        }
    }
}

/// Connectivity of a client record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    /// Teardown in progress; no longer a delivery target.
    Disconnecting,
    /// Tombstone. Kept so stale identifiers stay resolvable.
    Disconnected,
}

/// Everything the dispatcher knows about one client connection.
#[derive(Debug)]
pub struct ClientRecord {
    pub id: ClientIdentifier,
    pub kind: ClientKind,
    pub connectivity: Connectivity,
    /// Identities registered by this client, in registration order.
    services: Vec<ServiceIdentity>,
    subscriptions: Vec<MemberIdentity>,
}

impl ClientRecord {
    pub fn is_connected(&self) -> bool {
        self.connectivity == Connectivity::Connected
    }

    /// Whether this client registered the given identity.
    pub fn owns_service(&self, identity: ServiceIdentity) -> bool {
        self.services.contains(&identity)
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// The routing core. See the module docs for the model.
pub struct Dispatcher {
    services: Vec<Service>,
    notifications: Vec<Notification>,
    clients: HashMap<ClientIdentifier, ClientRecord>,
    listeners: Vec<Box<dyn ServiceRegistrationListener>>,
    next_client_id: ClientIdentifier,
    message_count: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            notifications: Vec::new(),
            clients: HashMap::new(),
            listeners: Vec::new(),
            next_client_id: 0,
            message_count: 0,
        }
    }

    /// Add a registration listener. Order matters; see
    /// [`ServiceRegistrationListener`].
    pub fn add_registration_listener(&mut self, listener: Box<dyn ServiceRegistrationListener>) {
        self.listeners.push(listener);
    }

    // ------------------------------------------------------------------
    // Clients
    // ------------------------------------------------------------------

    /// Admit a new client connection and assign its identifier.
    /// `u16::MAX` is never assigned; IPC frames use it as the no-client
    /// sentinel ([`crate::ipc::NO_CLIENT`]).
    pub fn on_new_client(&mut self, kind: ClientKind) -> ClientIdentifier {
        if self.next_client_id == ClientIdentifier::MAX {
            self.next_client_id = 0;
        }
        let id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1);
        tracing::info!(client = id, %kind, "client connected");
        self.clients.insert(
            id,
            ClientRecord {
                id,
                kind,
                connectivity: Connectivity::Connected,
                services: Vec::new(),
                subscriptions: Vec::new(),
            },
        );
        id
    }

    /// Tear down a client: unregister its services (listeners fire per
    /// service), drop its subscriptions, tombstone the record. The record
    /// itself stays so stale identifiers remain resolvable.
    pub fn on_client_disconnected(&mut self, id: ClientIdentifier, actions: &mut Vec<Action>) {
        let Some(record) = self.clients.get_mut(&id) else {
            tracing::warn!(client = id, "disconnect for unknown client");
            return;
        };
        if record.connectivity != Connectivity::Connected {
            return;
        }
        record.connectivity = Connectivity::Disconnecting;
        tracing::info!(client = id, kind = %record.kind, "client disconnected");

        let owned = record.services.clone();
        let subscribed = record.subscriptions.clone();
        for identity in owned {
            self.unregister_service(identity, actions);
        }
        for member in subscribed {
            self.unsubscribe_notification(id, member);
        }

        if let Some(record) = self.clients.get_mut(&id) {
            record.connectivity = Connectivity::Disconnected;
        }
    }

    pub fn client(&self, id: ClientIdentifier) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    /// Local clients currently connected; the runtime pings these.
    pub fn connected_local_clients(&self) -> Vec<ClientIdentifier> {
        let mut ids: Vec<_> = self
            .clients
            .values()
            .filter(|c| c.kind == ClientKind::Local && c.is_connected())
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ------------------------------------------------------------------
    // Message routing
    // ------------------------------------------------------------------

    /// Route one message. `origin` is the client the message arrived from.
    pub fn dispatch_message(
        &mut self,
        mut msg: Message,
        origin: ClientIdentifier,
        actions: &mut Vec<Action>,
    ) {
        self.message_count += 1;
        if self.message_count % 10_000 == 0 {
            tracing::info!(count = self.message_count, "message count");
        }
        tracing::debug!(
            client = origin,
            message_id = format_args!("{:#010x}", msg.header.message_id()),
            message_type = ?msg.header.message_type,
            "dispatching message"
        );

        if msg.header.is_notification() {
            let member = MemberIdentity {
                service_id: msg.header.service_id,
                instance_id: msg.instance_id,
                member_id: msg.header.member_id,
            };
            let notification = self.get_or_create_notification(member);
            let subscribers = notification.subscribers.clone();
            for target in subscribers {
                actions.push(Action::Deliver {
                    target,
                    message: msg.clone(),
                });
            }
        } else if msg.header.is_reply() {
            let Some(target) = msg.client_identifier else {
                tracing::warn!("reply without client identifier, dropping");
                return;
            };
            match self.clients.get(&target) {
                Some(record) if record.is_connected() => {
                    actions.push(Action::Deliver { target, message: msg });
                }
                _ => {
                    tracing::warn!(
                        client = target,
                        "reply target has disconnected, dropping answer"
                    );
                }
            }
        } else {
            // Request or RequestNoReturn. Requests expecting an answer
            // carry their origin out-of-band; the header stays untouched
            // here so a tag set by an upstream daemon survives transit.
            // Only the TCP egress writes the identifier into the wire.
            if msg.header.is_request_with_return() {
                msg.client_identifier = Some(origin);
            }

            let mut provided = false;
            let targets: Vec<ClientIdentifier> = self
                .services
                .iter()
                .filter(|s| s.identity.service_id == msg.header.service_id)
                .filter_map(|s| s.client)
                .collect();
            for target in targets {
                provided = true;
                actions.push(Action::Deliver {
                    target,
                    message: msg.clone(),
                });
            }

            if !provided {
                let identity = ServiceIdentity::new(msg.header.service_id, msg.instance_id);
                tracing::debug!(%identity, "request for unknown service");
                actions.push(Action::RequestActivation { identity });
                // The reply mirrors MessageID and RequestID verbatim
                let mut reply = Message::new(msg.header.error_reply(), bytes::Bytes::new());
                reply.instance_id = msg.instance_id;
                actions.push(Action::Deliver {
                    target: origin,
                    message: reply,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Service registry
    // ------------------------------------------------------------------

    pub fn service(&self, identity: ServiceIdentity) -> Option<&Service> {
        self.services.iter().find(|s| s.identity == identity)
    }

    /// All registered identities, in registration order.
    pub fn service_list(&self) -> Vec<ServiceIdentity> {
        self.services.iter().map(|s| s.identity).collect()
    }

    /// Identities of local services, for announcements.
    pub fn local_service_list(&self) -> Vec<ServiceIdentity> {
        self.services
            .iter()
            .filter(|s| s.is_local)
            .map(|s| s.identity)
            .collect()
    }

    /// Register a service. Rejects an exact-identity duplicate with no
    /// state change; on success notifies listeners in registration order
    /// and binds the service as provider on matching notifications.
    pub fn register_service(
        &mut self,
        identity: ServiceIdentity,
        client: ClientIdentifier,
        is_local: bool,
        actions: &mut Vec<Action>,
    ) -> RegisterOutcome {
        if self.services.iter().any(|s| s.identity == identity) {
            tracing::warn!(%identity, "service already registered");
            return RegisterOutcome::Duplicate;
        }

        let service = Service {
            identity,
            is_local,
            client: Some(client),
        };
        self.services.push(service.clone());
        if let Some(record) = self.clients.get_mut(&client) {
            record.services.push(identity);
        }
        tracing::info!(%identity, client, is_local, "service registered");

        for listener in &mut self.listeners {
            listener.on_service_registered(&service, actions);
        }
        actions.push(Action::RegistryChanged {
            identity,
            registered: true,
            owner: client,
        });

        for notification in &mut self.notifications {
            if notification.member.service_identity() == identity {
                notification.provider = Some(identity);
                if !notification.subscribers.is_empty() {
                    actions.push(Action::SubscriptionActive {
                        provider: client,
                        member: notification.member,
                    });
                }
            }
        }

        RegisterOutcome::Registered
    }

    /// Registration with the rebind/precedence rules applied:
    ///
    /// - identity exists, `is_local`: rebind succeeds only if the entry is
    ///   currently unbound (an announced service binding when its process
    ///   comes up);
    /// - identity exists, remote: refused — local providers win;
    /// - otherwise a plain registration.
    pub fn try_register_service(
        &mut self,
        identity: ServiceIdentity,
        client: ClientIdentifier,
        is_local: bool,
        actions: &mut Vec<Action>,
    ) -> bool {
        if let Some(pos) = self.services.iter().position(|s| s.identity == identity) {
            if is_local && self.services[pos].client.is_none() {
                self.services[pos].client = Some(client);
                if let Some(record) = self.clients.get_mut(&client) {
                    record.services.push(identity);
                }
                tracing::info!(%identity, client, "service bound to its provider");
                return true;
            }
            tracing::warn!(%identity, client, "registration refused");
            return false;
        }
        self.register_service(identity, client, is_local, actions) == RegisterOutcome::Registered
    }

    /// Remove a service. Listeners are notified in reverse registration
    /// order; provider links on notifications are cleared.
    pub fn unregister_service(&mut self, identity: ServiceIdentity, actions: &mut Vec<Action>) {
        let Some(pos) = self.services.iter().position(|s| s.identity == identity) else {
            tracing::warn!(%identity, "unregister for unknown service");
            return;
        };
        let service = self.services.remove(pos);

        for listener in self.listeners.iter_mut().rev() {
            listener.on_service_unregistered(&service, actions);
        }
        actions.push(Action::RegistryChanged {
            identity,
            registered: false,
            owner: service.client.unwrap_or(ClientIdentifier::MAX),
        });

        for notification in &mut self.notifications {
            if notification.provider == Some(identity) {
                notification.provider = None;
            }
        }

        if let Some(client) = service.client {
            if let Some(record) = self.clients.get_mut(&client) {
                record.services.retain(|s| *s != identity);
            }
        }
        tracing::info!(%identity, "service unregistered");
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Subscribe a client to a member. Idempotent. If a provider is bound,
    /// a provider-notify action is emitted so its transport can react
    /// (a remote provider gets a Subscribe relayed upstream).
    pub fn subscribe_notification(
        &mut self,
        client: ClientIdentifier,
        member: MemberIdentity,
        actions: &mut Vec<Action>,
    ) {
        let notification = self.get_or_create_notification(member);
        if notification.subscribers.contains(&client) {
            return;
        }
        notification.subscribers.push(client);
        let provider = notification.provider;
        tracing::debug!(client, %member, "client subscribed");

        if let Some(record) = self.clients.get_mut(&client) {
            record.subscriptions.push(member);
        }

        if let Some(provider_identity) = provider {
            if let Some(provider_client) =
                self.service(provider_identity).and_then(|s| s.client)
            {
                actions.push(Action::SubscriptionActive {
                    provider: provider_client,
                    member,
                });
            }
        }
    }

    /// Remove a client from a member's subscriber list.
    pub fn unsubscribe_notification(&mut self, client: ClientIdentifier, member: MemberIdentity) {
        if let Some(notification) = self
            .notifications
            .iter_mut()
            .find(|n| n.member == member)
        {
            notification.subscribers.retain(|c| *c != client);
        }
        if let Some(record) = self.clients.get_mut(&client) {
            record.subscriptions.retain(|m| *m != member);
        }
    }

    fn get_or_create_notification(&mut self, member: MemberIdentity) -> &mut Notification {
        if let Some(pos) = self.notifications.iter().position(|n| n.member == member) {
            return &mut self.notifications[pos];
        }
        let provider = self
            .service(member.service_identity())
            .map(|s| s.identity);
        self.notifications.push(Notification {
            member,
            subscribers: Vec::new(),
            provider,
        });
        self.notifications.last_mut().unwrap()
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// A human-readable snapshot of the registries.
    pub fn dump_state(&self) -> String {
        use std::fmt::Write;

        let mut s = String::from("Services:\n");
        for service in &self.services {
            let _ = writeln!(
                s,
                "  {} {} client={:?}",
                service.identity,
                if service.is_local { "local" } else { "remote" },
                service.client
            );
        }
        s.push_str("--------------\nNotifications:\n");
        for notification in &self.notifications {
            let _ = writeln!(
                s,
                "  {} provider={:?} subscribers={:?}",
                notification.member, notification.provider, notification.subscribers
            );
        }
        s.push_str("--------------\nClients:\n");
        let mut ids: Vec<_> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let record = &self.clients[&id];
            let _ = writeln!(
                s,
                "  #{} {} {:?}",
                record.id, record.kind, record.connectivity
            );
        }
        s
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
