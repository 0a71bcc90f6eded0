//! # someip-dispatch
//!
//! A **SOME/IP message dispatcher** for [tokio](https://tokio.rs): routes
//! request/response and publish/subscribe traffic between local processes
//! (IPC over a Unix stream socket) and remote hosts (TCP, with UDP-broadcast
//! service discovery).
//!
//! SOME/IP (Scalable service-Oriented `MiddlewarE` over IP) is the standard
//! middleware protocol for automotive Ethernet communication. This crate
//! implements the *dispatcher* role: a daemon-side hub that local
//! applications connect to, which transparently bridges them to services on
//! other hosts.
//!
//! ## Quick Start
//!
//! ```no_run
//! use someip_dispatch::config::DispatcherConfig;
//! use someip_dispatch::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> someip_dispatch::Result<()> {
//!     let config = DispatcherConfig::builder()
//!         .socket_path("/tmp/someip-dispatch.socket")
//!         .build()?;
//!
//!     Runtime::new(config).run().await
//! }
//! ```
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────┐   Unix socket    ┌──────────────────────────────────┐
//! │ local client │◄────IPC frames──►│        Runtime (event loop)       │
//! └──────────────┘                  │  ┌────────────────────────────┐  │
//! ┌──────────────┐    TCP           │  │ Dispatcher                 │  │
//! │ remote peer  │◄──SOME/IP frames►│  │  • services / notifications│  │
//! └──────────────┘                  │  │  • clients (tombstoned)    │  │
//! ┌──────────────┐    UDP 10102     │  │  • registration listeners  │  │
//! │ SD broadcast │◄───SD messages──►│  └────────────────────────────┘  │
//! └──────────────┘                  └──────────────────────────────────┘
//! ```
//!
//! All mutable state is owned by a single event-loop task; per-connection
//! tasks only move bytes and feed decoded frames to the runtime over `mpsc`
//! channels. Handler functions take `&mut` state and return
//! [`Action`](dispatcher::Action) values for the event loop to execute, so
//! there are no locks in the core.
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`runtime`] | Event loop, socket tasks, timers, action execution |
//! | [`dispatcher`] | Routing core: services, notifications, clients |
//! | [`wire`] | SOME/IP + SD wire format, RequestID tagging |
//! | [`ipc`] | Local IPC frame format |
//! | [`connection`] | Congestion-aware non-blocking stream transport |
//! | [`sd`] | Service discovery: sessions, reboot detection, announcer |
//! | [`tcp`] | TCP server (port probing), peer pool, peer codec |
//! | [`local`] | Local IPC client handling |
//! | [`activation`] | On-demand service activation boundary |
//! | [`config`] | [`DispatcherConfig`](config::DispatcherConfig) + builder |
//! | [`error`] | [`Error`] / [`Result`] |
//! | [`net`] | Socket traits (tokio impls, test fakes) |

use std::fmt;

pub mod activation;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod ipc;
pub mod local;
pub mod net;
pub mod runtime;
pub mod sd;
pub mod tcp;
pub mod wire;

pub use error::{Error, Result};

/// Service identifier (high 16 bits of a MessageID).
pub type ServiceId = u16;

/// Service instance identifier. Not part of the SOME/IP header; carried
/// out-of-band and stamped by the transport layer.
pub type InstanceId = u16;

/// Member identifier: a method or event within a service (low 16 bits of a
/// MessageID).
pub type MemberId = u16;

/// Identifies a client connection within one dispatcher lifetime.
///
/// Assigned monotonically and never reused, so a stale identifier inside an
/// in-flight reply can still be resolved (to a tombstone) after the client
/// disconnected.
pub type ClientIdentifier = u16;

/// A service together with the instance providing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
}

impl ServiceIdentity {
    pub fn new(service_id: ServiceId, instance_id: InstanceId) -> Self {
        Self {
            service_id,
            instance_id,
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}:{:#06x}", self.service_id, self.instance_id)
    }
}

/// A member (method or event) of a concrete service instance. This is the
/// key notifications are routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberIdentity {
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub member_id: MemberId,
}

impl MemberIdentity {
    pub fn new(service: ServiceIdentity, member_id: MemberId) -> Self {
        Self {
            service_id: service.service_id,
            instance_id: service.instance_id,
            member_id,
        }
    }

    /// The service part of this identity.
    pub fn service_identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.service_id, self.instance_id)
    }
}

impl fmt::Display for MemberIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#06x}:{:#06x}/{:#06x}",
            self.service_id, self.instance_id, self.member_id
        )
    }
}
