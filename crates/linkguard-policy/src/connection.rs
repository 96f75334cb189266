//! Per-connection context types.
//!
//! A `ConnectionState` is owned by the connection's own processing context
//! and is only ever touched from there, so its counters need no
//! synchronization. The resolved profile is shared via Arc.

use std::sync::Arc;

use crate::admission::AdmissionPermit;
use crate::profile::PolicyProfile;

/// Terminus capability marking an internal routing (waypoint) link.
pub const WAYPOINT_CAPABILITY: &str = "qd.waypoint";

/// Role the peer negotiated for this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionRole {
    #[default]
    Normal,
    /// Router-to-router trust relationship; never governed by vhost policy.
    InterRouter,
    RouteContainer,
    Edge,
}

impl ConnectionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionRole::Normal => "normal",
            ConnectionRole::InterRouter => "inter-router",
            ConnectionRole::RouteContainer => "route-container",
            ConnectionRole::Edge => "edge",
        }
    }
}

/// Permissions already granted by an earlier authorization layer (for
/// example a SASL plugin). Settings from the identity authority never take
/// these away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthzGrants {
    pub allow_anonymous_sender: bool,
    pub allow_dynamic_source: bool,
    /// Operator CSV allow list for receiver sources.
    pub sources: Option<String>,
    /// Operator CSV allow list for sender targets.
    pub targets: Option<String>,
}

impl AuthzGrants {
    pub fn is_empty(&self) -> bool {
        *self == AuthzGrants::default()
    }
}

/// What the transport knows about a freshly accepted socket.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub id: u64,
    /// Authenticated user; empty for anonymous.
    pub principal: String,
    /// Numeric remote address.
    pub remote_host: String,
    /// Connection name used for tracking (usually `host:port`).
    pub name: String,
    pub role: ConnectionRole,
    pub grants: AuthzGrants,
}

/// Where a connection sits in the policy lifecycle.
#[derive(Debug, Clone)]
pub enum Phase {
    /// Socket admitted, Open not seen yet.
    Accepted,
    /// Open received, waiting on the identity authority.
    PendingIdentity,
    /// Not subject to vhost policy.
    Ungoverned,
    Governed(Arc<PolicyProfile>),
    /// Open refused; the connection is being closed.
    Denied,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Accepted => "accepted",
            Phase::PendingIdentity => "pending_identity",
            Phase::Ungoverned => "ungoverned",
            Phase::Governed(_) => "governed",
            Phase::Denied => "denied",
        }
    }
}

/// Link direction from the router's point of view of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Peer sends to the router; checked against its target.
    Sender,
    /// Peer receives from the router; checked against its source.
    Receiver,
}

/// The parts of an Attach terminus the policy looks at.
#[derive(Debug, Clone, Default)]
pub struct Terminus {
    pub address: Option<String>,
    pub dynamic: bool,
    pub capabilities: Vec<String>,
}

impl Terminus {
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            address: Some(addr.into()),
            ..Self::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn dynamic() -> Self {
        Self {
            dynamic: true,
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.push(cap.into());
        self
    }

    /// Address if present and non-empty.
    pub fn named(&self) -> Option<&str> {
        self.address.as_deref().filter(|a| !a.is_empty())
    }

    /// Only the first capability symbol is inspected.
    pub fn is_waypoint(&self) -> bool {
        self.capabilities
            .first()
            .is_some_and(|c| c.starts_with(WAYPOINT_CAPABILITY))
    }
}

/// Policy state of one connection.
#[derive(Debug)]
pub struct ConnectionState {
    pub(crate) info: ConnectionInfo,
    pub(crate) vhost: Option<String>,
    pub(crate) phase: Phase,
    pub(crate) n_sessions: u32,
    pub(crate) n_senders: u32,
    pub(crate) n_receivers: u32,
    /// The authority accepted this identity and expects a close notice.
    pub(crate) authority_tracked: bool,
    pub(crate) _permit: AdmissionPermit,
}

impl ConnectionState {
    pub(crate) fn new(info: ConnectionInfo, permit: AdmissionPermit) -> Self {
        Self {
            info,
            vhost: None,
            phase: Phase::Accepted,
            n_sessions: 0,
            n_senders: 0,
            n_receivers: 0,
            authority_tracked: false,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }
    pub fn principal(&self) -> &str {
        &self.info.principal
    }
    pub fn remote_host(&self) -> &str {
        &self.info.remote_host
    }
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }
    /// Vhost the connection was placed on at Open: the one the identity
    /// authority resolved, or the requested one if Open was denied first.
    pub fn vhost(&self) -> Option<&str> {
        self.vhost.as_deref()
    }
    pub fn phase(&self) -> &Phase {
        &self.phase
    }
    pub fn profile(&self) -> Option<&Arc<PolicyProfile>> {
        match &self.phase {
            Phase::Governed(p) => Some(p),
            _ => None,
        }
    }
    pub fn n_sessions(&self) -> u32 {
        self.n_sessions
    }
    pub fn n_senders(&self) -> u32 {
        self.n_senders
    }
    pub fn n_receivers(&self) -> u32 {
        self.n_receivers
    }
}
