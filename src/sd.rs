//! Service discovery.
//!
//! Four pieces:
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`SdSessions`] | Outbound session counters + local reboot flag |
//! | [`RebootTable`] | Per-(peer, channel) reboot detection |
//! | [`ServiceAnnouncer`] | Registration listener broadcasting offers |
//! | [`handle_sd_message`] | Inbound decoder producing [`SdEvent`]s |
//!
//! Session IDs are 16-bit, start at 1 and wrap 0xFFFF → 1 (never 0); the
//! local reboot flag stays raised from startup until the first wrap, per
//! channel. A peer reboot is detected when a message carries the reboot
//! flag *and* a session ID lower than the last one seen from that peer on
//! that channel.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use crate::dispatcher::{Action, Service, ServiceRegistrationListener};
use crate::wire::{
    EventgroupEntryKind, SdEntry, SdMessage, SdOption, ServiceEntryKind, TransportProtocol,
};
use crate::{MemberIdentity, ServiceIdentity};

/// 24-bit TTL value meaning "does not expire".
pub const TTL_FOREVER: u32 = 0xFF_FFFF;

// ============================================================================
// SESSIONS
// ============================================================================

/// Outbound SD session state: separate counters for multicast and unicast,
/// each with its own reboot flag.
#[derive(Debug)]
pub struct SdSessions {
    multicast_id: u16,
    unicast_id: u16,
    multicast_reboot: bool,
    unicast_reboot: bool,
}

impl SdSessions {
    /// A fresh process starts at session 1 with the reboot flag raised.
    pub fn new() -> Self {
        Self {
            multicast_id: 1,
            unicast_id: 1,
            multicast_reboot: true,
            unicast_reboot: true,
        }
    }

    /// Take the next session ID and the flags byte for one outbound SD
    /// message on the given channel.
    pub fn next(&mut self, unicast: bool) -> (u16, u8) {
        let (id, reboot) = if unicast {
            (&mut self.unicast_id, &mut self.unicast_reboot)
        } else {
            (&mut self.multicast_id, &mut self.multicast_reboot)
        };

        // Flags belong to this session, so read the reboot state before
        // advancing the counter: the final pre-wrap message still carries it
        let session = *id;
        let mut flags = 0;
        if *reboot {
            flags |= SdMessage::FLAG_REBOOT;
        }
        if unicast {
            flags |= SdMessage::FLAG_UNICAST;
        }

        *id = id.wrapping_add(1);
        if *id == 0 {
            // Wrapped: never emit 0, and the reboot flag is history now
            *id = 1;
            *reboot = false;
        }
        (session, flags)
    }

    /// Stamp flags and session onto an outbound message.
    pub fn stamp(&mut self, message: &mut SdMessage, unicast: bool) {
        let (session, flags) = self.next(unicast);
        message.session_id = session;
        message.flags = flags;
    }
}

impl Default for SdSessions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// REBOOT DETECTION
// ============================================================================

/// Which path an SD message arrived on. Reboot state is tracked per
/// channel because the peer counts sessions per channel too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdChannel {
    Unicast,
    Multicast,
}

/// Last session seen from one peer on one channel.
#[derive(Debug, Default)]
pub struct RebootInformation {
    last_session_id: u16,
}

impl RebootInformation {
    /// Record a session and report whether it proves a reboot: the reboot
    /// flag is set and the session went backwards.
    pub fn update_and_check(&mut self, reboot_flag: bool, session_id: u16) -> bool {
        let rebooted = reboot_flag && session_id < self.last_session_id;
        self.last_session_id = session_id;
        rebooted
    }
}

/// Reboot detection state for all peers.
#[derive(Debug, Default)]
pub struct RebootTable {
    peers: HashMap<(IpAddr, SdChannel), RebootInformation>,
}

impl RebootTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &mut self,
        peer: IpAddr,
        channel: SdChannel,
        reboot_flag: bool,
        session_id: u16,
    ) -> bool {
        self.peers
            .entry((peer, channel))
            .or_default()
            .update_and_check(reboot_flag, session_id)
    }

    /// Forget a peer (after its connections were torn down).
    pub fn forget(&mut self, peer: IpAddr) {
        self.peers.retain(|(ip, _), _| *ip != peer);
    }
}

// ============================================================================
// ANNOUNCER
// ============================================================================

/// Broadcasts OfferService for local registrations and the ttl=0 withdrawal
/// on unregistration. Added as the *first* registration listener: the
/// reverse-order contract then guarantees the withdrawal goes out while
/// endpoint state maintained by later listeners is still valid.
pub struct ServiceAnnouncer {
    endpoint: SocketAddrV4,
    ttl: u32,
}

impl ServiceAnnouncer {
    /// `endpoint` is the local TCP server endpoint placed into offers.
    pub fn new(endpoint: SocketAddrV4, ttl: u32) -> Self {
        Self { endpoint, ttl }
    }

    /// An offer (or withdrawal, for ttl=0) for one identity.
    pub fn build_offer(&self, identity: ServiceIdentity, ttl: u32) -> SdMessage {
        let mut message = SdMessage::new();
        let opt = message.add_option(SdOption::Ipv4Endpoint {
            addr: *self.endpoint.ip(),
            port: self.endpoint.port(),
            protocol: TransportProtocol::Tcp,
        });
        message.add_entry(SdEntry::offer(
            identity.service_id,
            identity.instance_id,
            1,
            ttl,
            opt,
            1,
        ));
        message
    }

    /// One message re-offering every local service, for the periodic
    /// re-announce timer.
    pub fn build_announcement(&self, identities: &[ServiceIdentity]) -> SdMessage {
        let mut message = SdMessage::new();
        let opt = message.add_option(SdOption::Ipv4Endpoint {
            addr: *self.endpoint.ip(),
            port: self.endpoint.port(),
            protocol: TransportProtocol::Tcp,
        });
        for identity in identities {
            message.add_entry(SdEntry::offer(
                identity.service_id,
                identity.instance_id,
                1,
                self.ttl,
                opt,
                1,
            ));
        }
        message
    }
}

impl ServiceRegistrationListener for ServiceAnnouncer {
    fn on_service_registered(&mut self, service: &Service, actions: &mut Vec<Action>) {
        // Remote services are not re-published
        if !service.is_local {
            return;
        }
        tracing::info!(identity = %service.identity, "publishing service");
        actions.push(Action::SendSdBroadcast {
            message: self.build_offer(service.identity, self.ttl),
        });
    }

    fn on_service_unregistered(&mut self, service: &Service, actions: &mut Vec<Action>) {
        if !service.is_local {
            return;
        }
        tracing::info!(identity = %service.identity, "unpublishing service");
        actions.push(Action::SendSdBroadcast {
            message: self.build_offer(service.identity, 0),
        });
    }
}

/// Build the Subscribe relayed to a remote provider when a local client
/// subscribes to one of its members.
pub fn build_subscribe_message(member: MemberIdentity, ttl: u32) -> SdMessage {
    let mut message = SdMessage::new();
    message.add_entry(SdEntry::subscribe(
        member.service_id,
        member.instance_id,
        member.member_id,
        ttl,
    ));
    message
}

// ============================================================================
// INBOUND
// ============================================================================

/// What an inbound SD message asks us to do. Produced by
/// [`handle_sd_message`], consumed by the runtime.
#[derive(Debug, PartialEq, Eq)]
pub enum SdEvent {
    /// A peer offers a service; connect/reuse a TCP peer and register it.
    RemoteOffer {
        identity: ServiceIdentity,
        endpoint: SocketAddrV4,
    },
    /// A peer withdrew an offer (ttl=0).
    RemoteWithdraw { identity: ServiceIdentity },
    /// A peer is looking for a service; answer with matching local offers.
    RemoteFind {
        service_id: u16,
        instance_id: u16,
        from: SocketAddr,
    },
    /// A peer subscribes to a member of one of our services.
    RemoteSubscribe {
        member: MemberIdentity,
        from: SocketAddr,
    },
    /// A peer unsubscribed (ttl=0).
    RemoteUnsubscribe {
        member: MemberIdentity,
        from: SocketAddr,
    },
    /// Reboot detected; tear down and forget everything from this peer.
    PeerRebooted { peer: IpAddr },
}

/// Decode one SD message into events. Runs reboot detection first, so a
/// rebooted peer's fresh offers still take effect after the teardown event.
pub fn handle_sd_message(
    message: &SdMessage,
    from: SocketAddr,
    channel: SdChannel,
    reboots: &mut RebootTable,
    events: &mut Vec<SdEvent>,
) {
    if reboots.check(
        from.ip(),
        channel,
        message.has_reboot_flag(),
        message.session_id,
    ) {
        tracing::warn!(peer = %from.ip(), "peer reboot detected");
        reboots.forget(from.ip());
        events.push(SdEvent::PeerRebooted { peer: from.ip() });
    }

    for entry in &message.entries {
        match entry {
            SdEntry::Service(service_entry) => match service_entry.kind {
                ServiceEntryKind::OfferService => {
                    let identity =
                        ServiceIdentity::new(service_entry.service_id, service_entry.instance_id);
                    if service_entry.ttl == 0 {
                        tracing::debug!(%identity, peer = %from.ip(), "offer withdrawn");
                        events.push(SdEvent::RemoteWithdraw { identity });
                    } else {
                        let Some(endpoint) = message.tcp_endpoint_for(entry) else {
                            tracing::warn!(%identity, "offer without TCP endpoint, ignoring");
                            continue;
                        };
                        // An unspecified address means "the sender itself"
                        let endpoint = if endpoint.ip().is_unspecified() {
                            match from.ip() {
                                IpAddr::V4(ip) => SocketAddrV4::new(ip, endpoint.port()),
                                IpAddr::V6(_) => {
                                    tracing::warn!(%identity, "IPv6 peer not supported");
                                    continue;
                                }
                            }
                        } else {
                            endpoint
                        };
                        tracing::debug!(%identity, %endpoint, ttl = service_entry.ttl,
                            "remote service offered");
                        events.push(SdEvent::RemoteOffer { identity, endpoint });
                    }
                }
                ServiceEntryKind::FindService => {
                    events.push(SdEvent::RemoteFind {
                        service_id: service_entry.service_id,
                        instance_id: service_entry.instance_id,
                        from,
                    });
                }
            },
            SdEntry::Eventgroup(eventgroup_entry) => {
                let member = MemberIdentity {
                    service_id: eventgroup_entry.service_id,
                    instance_id: eventgroup_entry.instance_id,
                    member_id: eventgroup_entry.eventgroup_id,
                };
                match eventgroup_entry.kind {
                    EventgroupEntryKind::Subscribe => {
                        if eventgroup_entry.ttl == 0 {
                            events.push(SdEvent::RemoteUnsubscribe { member, from });
                        } else {
                            events.push(SdEvent::RemoteSubscribe { member, from });
                        }
                    }
                    EventgroupEntryKind::SubscribeAck => {
                        tracing::debug!(%member, ack = eventgroup_entry.ttl != 0,
                            "subscription acknowledgement");
                    }
                }
            }
        }
    }
}
