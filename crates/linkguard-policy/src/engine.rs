//! Connection lifecycle engine.
//!
//! The router calls into the engine at socket accept, AMQP Open, session
//! Begin and link Attach, and again on teardown. Every decision fails closed:
//! anything the engine cannot positively approve is denied with a protocol
//! condition the caller forwards to the peer.
//!
//! Only `open` and `close` suspend (they talk to the identity authority);
//! Begin/Attach decisions are synchronous and touch nothing but the
//! connection's own state and the shared, immutable profile.

use std::sync::Arc;

use linkguard_core::error::Condition;

use crate::admission::{AdmissionGate, AdmissionSnapshot};
use crate::authority::{IdentityAuthority, SerializedAuthority, UserLookup};
use crate::config::PolicySection;
use crate::connection::{ConnectionInfo, ConnectionRole, ConnectionState, LinkRole, Phase, Terminus};
use crate::hostname::{HostnamePatternIndex, PatternRejected};
use crate::obs::metrics::{escape_label, PolicyMetrics};
use crate::profile::{DenialSnapshot, PolicyProfile, ProfileCache};

pub const CONNECTION_DISALLOWED: &str = "connection disallowed by local policy";
pub const SESSION_DISALLOWED: &str = "session disallowed by local policy";
pub const LINK_DISALLOWED: &str = "link disallowed by local policy";

/// Why a connection, session, or link was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denial {
    pub condition: Condition,
    pub description: &'static str,
}

impl Denial {
    fn connection(condition: Condition) -> Self {
        Self {
            condition,
            description: CONNECTION_DISALLOWED,
        }
    }
    fn session(condition: Condition) -> Self {
        Self {
            condition,
            description: SESSION_DISALLOWED,
        }
    }
    fn link(condition: Condition) -> Self {
        Self {
            condition,
            description: LINK_DISALLOWED,
        }
    }
}

/// Limits the caller applies to the transport before answering Open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportLimits {
    pub max_frame_size: Option<u32>,
    pub channel_max: Option<u16>,
}

impl TransportLimits {
    fn for_profile(p: &PolicyProfile) -> Self {
        Self {
            max_frame_size: (p.max_frame_size > 0).then_some(p.max_frame_size),
            channel_max: (p.max_sessions > 0)
                .then(|| u16::try_from(p.max_sessions - 1).unwrap_or(u16::MAX)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    Allow(TransportLimits),
    Deny(Denial),
}

impl OpenDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, OpenDecision::Allow(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    /// Admit the session with this incoming window, in bytes.
    Allow { incoming_capacity: u64 },
    Deny(Denial),
}

impl SessionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SessionDecision::Allow { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDecision {
    Allow,
    Deny(Denial),
}

impl LinkDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LinkDecision::Allow)
    }
}

/// Admission control and authorization across the connection lifecycle.
/// Construct once at startup and share via Arc.
pub struct PolicyEngine {
    settings: PolicySection,
    gate: Arc<AdmissionGate>,
    hostnames: HostnamePatternIndex<String>,
    profiles: ProfileCache,
    authority: SerializedAuthority,
    metrics: Arc<PolicyMetrics>,
}

impl PolicyEngine {
    pub fn new(settings: PolicySection, authority: Arc<dyn IdentityAuthority>) -> Self {
        let metrics = Arc::new(PolicyMetrics::default());
        Self {
            gate: Arc::new(AdmissionGate::new(settings.max_connections)),
            hostnames: HostnamePatternIndex::new(),
            profiles: ProfileCache::new(),
            authority: SerializedAuthority::new(authority, Arc::clone(&metrics)),
            metrics,
            settings,
        }
    }

    /// Use an externally owned gate (shared with other listeners, or a test's).
    pub fn with_admission_gate(mut self, gate: Arc<AdmissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn settings(&self) -> &PolicySection {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<PolicyMetrics> {
        &self.metrics
    }

    // ---- accept ----

    /// Count a freshly accepted socket. `None` means close it immediately.
    pub fn accept(&self, info: ConnectionInfo) -> Option<ConnectionState> {
        let permit = self.gate.admit(&info.remote_host);
        self.metrics.decision("accept", permit.is_some());
        permit.map(|p| ConnectionState::new(info, p))
    }

    // ---- open ----

    /// Resolve the connection's identity to a profile and return the
    /// transport limits to apply. `hostname` is the Open frame's hostname.
    pub async fn open(&self, conn: &mut ConnectionState, hostname: Option<&str>) -> OpenDecision {
        let decision = self.open_inner(conn, hostname).await;
        self.metrics.decision("open", decision.is_allowed());
        decision
    }

    async fn open_inner(&self, conn: &mut ConnectionState, hostname: Option<&str>) -> OpenDecision {
        if !matches!(conn.phase, Phase::Accepted) {
            tracing::warn!(conn_id = conn.id(), phase = conn.phase.as_str(), "DENY AMQP Open on a connection already opened");
            return OpenDecision::Deny(Denial::connection(Condition::UnauthorizedAccess));
        }

        if !self.settings.enable_vhost_policy || conn.info.role == ConnectionRole::InterRouter {
            conn.phase = Phase::Ungoverned;
            tracing::trace!(conn_id = conn.id(), role = conn.info.role.as_str(), "ALLOW AMQP Open, not governed by vhost policy");
            return OpenDecision::Allow(TransportLimits::default());
        }

        let raw = hostname.unwrap_or_default();
        let requested = if self.settings.enable_vhost_name_patterns {
            self.hostnames.lookup(raw).unwrap_or_else(|| raw.to_string())
        } else {
            raw.to_string()
        };
        conn.vhost = Some(requested.clone());
        conn.phase = Phase::PendingIdentity;

        let lookup = UserLookup {
            principal: &conn.info.principal,
            remote_ip: &conn.info.remote_host,
            vhost: &requested,
            connection_name: &conn.info.name,
            connection_id: conn.info.id,
        };
        let resolved = match self.authority.lookup_user(&lookup).await {
            Ok(Some(r)) if !r.profile.is_empty() => r,
            Ok(_) => {
                conn.phase = Phase::Denied;
                tracing::info!(
                    conn_id = conn.id(),
                    user = %conn.info.principal,
                    rhost = %conn.info.remote_host,
                    vhost = %requested,
                    "DENY AMQP Open, no policy profile for user"
                );
                return OpenDecision::Deny(Denial::connection(Condition::ResourceLimitExceeded));
            }
            Err(e) => {
                conn.phase = Phase::Denied;
                tracing::error!(
                    conn_id = conn.id(),
                    user = %conn.info.principal,
                    vhost = %requested,
                    error = %e,
                    "DENY AMQP Open, identity authority lookup failed"
                );
                return OpenDecision::Deny(Denial::connection(e.condition()));
            }
        };
        conn.authority_tracked = true;
        // from here on the connection belongs to the vhost the authority chose
        let vhost = resolved.vhost;
        let profile_name = resolved.profile;
        conn.vhost = Some(vhost.clone());

        let profile = match self.resolve_profile(&vhost, &profile_name).await {
            Ok(p) => p,
            Err(e) => {
                conn.phase = Phase::Denied;
                tracing::error!(
                    conn_id = conn.id(),
                    user = %conn.info.principal,
                    vhost = %vhost,
                    profile = %profile_name,
                    error = %e,
                    "DENY AMQP Open, profile settings unavailable"
                );
                return OpenDecision::Deny(Denial::connection(e.condition()));
            }
        };
        let profile = if conn.info.grants.is_empty() {
            profile
        } else {
            Arc::new(profile.with_grants(&conn.info.grants))
        };

        let limits = TransportLimits::for_profile(&profile);
        self.metrics.governed_connections.inc(&[("vhost", &vhost)]);
        tracing::trace!(
            conn_id = conn.id(),
            user = %conn.info.principal,
            rhost = %conn.info.remote_host,
            vhost = %vhost,
            profile = %profile.name,
            "ALLOW AMQP Open"
        );
        conn.phase = Phase::Governed(profile);
        OpenDecision::Allow(limits)
    }

    async fn resolve_profile(&self, vhost: &str, name: &str) -> linkguard_core::Result<Arc<PolicyProfile>> {
        if let Some(p) = self.profiles.get(vhost, name) {
            return Ok(p);
        }
        let bag = self.authority.lookup_settings(vhost, name).await?;
        self.profiles.publish(vhost, name, &bag)
    }

    // ---- sessions ----

    pub fn approve_session(&self, conn: &mut ConnectionState) -> SessionDecision {
        let decision = match &conn.phase {
            Phase::Ungoverned => {
                conn.n_sessions += 1;
                SessionDecision::Allow {
                    incoming_capacity: self.settings.default_session_capacity,
                }
            }
            Phase::Governed(p) => {
                if p.max_sessions > 0 && conn.n_sessions >= p.max_sessions {
                    p.denial_counts().session_denied();
                    tracing::info!(
                        conn_id = conn.info.id,
                        user = %conn.info.principal,
                        rhost = %conn.info.remote_host,
                        limit = p.max_sessions,
                        "DENY AMQP Begin Session due to session limit"
                    );
                    SessionDecision::Deny(Denial::session(Condition::ResourceLimitExceeded))
                } else {
                    conn.n_sessions += 1;
                    let incoming_capacity = if p.max_session_window > 0 {
                        u64::from(p.max_session_window)
                    } else {
                        self.settings.default_session_capacity
                    };
                    SessionDecision::Allow { incoming_capacity }
                }
            }
            other => {
                tracing::info!(conn_id = conn.info.id, phase = other.as_str(), "DENY AMQP Begin Session before Open completed");
                SessionDecision::Deny(Denial::session(Condition::UnauthorizedAccess))
            }
        };
        self.metrics.decision("session", decision.is_allowed());
        decision
    }

    pub fn session_ended(&self, conn: &mut ConnectionState) {
        debug_assert!(conn.n_sessions > 0, "session end without a matching begin");
        conn.n_sessions = conn.n_sessions.saturating_sub(1);
    }

    // ---- links ----

    /// Peer attaches a sending link; `target` is its target terminus.
    pub fn approve_sender(&self, conn: &mut ConnectionState, target: &Terminus) -> LinkDecision {
        let decision = self.approve_link(conn, LinkRole::Sender, target);
        self.metrics.decision("sender", decision.is_allowed());
        decision
    }

    /// Peer attaches a receiving link; `source` is its source terminus.
    pub fn approve_receiver(&self, conn: &mut ConnectionState, source: &Terminus) -> LinkDecision {
        let decision = self.approve_link(conn, LinkRole::Receiver, source);
        self.metrics.decision("receiver", decision.is_allowed());
        decision
    }

    pub fn link_detached(&self, conn: &mut ConnectionState, role: LinkRole) {
        let n = match role {
            LinkRole::Sender => &mut conn.n_senders,
            LinkRole::Receiver => &mut conn.n_receivers,
        };
        debug_assert!(*n > 0, "link detach without a matching attach");
        *n = n.saturating_sub(1);
    }

    fn approve_link(&self, conn: &mut ConnectionState, role: LinkRole, terminus: &Terminus) -> LinkDecision {
        let governed = match &conn.phase {
            Phase::Ungoverned => None,
            Phase::Governed(p) => Some(Arc::clone(p)),
            other => {
                tracing::info!(conn_id = conn.info.id, phase = other.as_str(), "DENY AMQP Attach before Open completed");
                return LinkDecision::Deny(Denial::link(Condition::UnauthorizedAccess));
            }
        };
        let Some(profile) = governed else {
            bump(conn, role);
            return LinkDecision::Allow;
        };

        let (dir, limit, current) = match role {
            LinkRole::Sender => ("sender", profile.max_senders, conn.n_senders),
            LinkRole::Receiver => ("receiver", profile.max_receivers, conn.n_receivers),
        };
        if limit > 0 && current >= limit {
            count_denial(&profile, role);
            tracing::info!(
                conn_id = conn.info.id,
                user = %conn.info.principal,
                rhost = %conn.info.remote_host,
                limit,
                "DENY AMQP Attach {dir} due to {dir} limit"
            );
            return LinkDecision::Deny(Denial::link(Condition::ResourceLimitExceeded));
        }

        let allowed = self.link_name_allowed(conn, &profile, role, terminus);
        if !allowed {
            count_denial(&profile, role);
            return LinkDecision::Deny(Denial::link(Condition::UnauthorizedAccess));
        }
        bump(conn, role);
        LinkDecision::Allow
    }

    fn link_name_allowed(&self, conn: &ConnectionState, p: &PolicyProfile, role: LinkRole, terminus: &Terminus) -> bool {
        let user = conn.principal();
        let (dir, term, matcher) = match role {
            LinkRole::Sender => ("sender", "target", p.target_matcher()),
            LinkRole::Receiver => ("receiver", "source", p.source_matcher()),
        };

        if role == LinkRole::Receiver && terminus.dynamic {
            let ok = p.allow_dynamic_source;
            log_link(conn, dir, "dynamic source", ok);
            return ok;
        }

        let Some(addr) = terminus.named() else {
            return match role {
                LinkRole::Sender => {
                    let ok = p.allow_anonymous_sender;
                    log_link(conn, dir, "anonymous target", ok);
                    ok
                }
                LinkRole::Receiver => {
                    log_link(conn, dir, "absent source", false);
                    false
                }
            };
        };

        if terminus.is_waypoint() && !p.allow_waypoint_links {
            log_link(conn, dir, addr, false);
            return false;
        }

        let ok = match matcher.approve(user, addr) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(
                    conn_id = conn.info.id,
                    user = %user,
                    vhost = %p.vhost,
                    profile = %p.name,
                    error = %e,
                    "{term} rule cannot be evaluated; link denied"
                );
                false
            }
        };
        log_link(conn, dir, addr, ok);
        ok
    }

    // ---- close ----

    /// Tear down the connection's policy state. Releases its admission slot
    /// when `conn` drops at the end of this call.
    pub async fn close(&self, conn: ConnectionState) {
        if conn.authority_tracked {
            if let Err(e) = self.authority.on_close(conn.info.id).await {
                tracing::warn!(conn_id = conn.info.id, error = %e, "identity authority close notification failed");
            }
        }
        if let (Phase::Governed(_), Some(vhost)) = (&conn.phase, conn.vhost.as_deref()) {
            self.metrics.governed_connections.dec(&[("vhost", vhost)]);
        }
        tracing::trace!(conn_id = conn.info.id, phase = conn.phase.as_str(), "connection closed");
    }

    // ---- management ----

    pub fn admission(&self) -> AdmissionSnapshot {
        self.gate.snapshot()
    }

    pub fn profile_denials(&self) -> Vec<DenialSnapshot> {
        self.profiles.denials()
    }

    /// Compiled profiles currently cached.
    pub fn cached_profiles(&self) -> usize {
        self.profiles.len()
    }

    /// Drop compiled profiles so the next Open re-reads settings. Live
    /// connections keep the profile they resolved.
    pub fn invalidate_profiles(&self) {
        self.profiles.invalidate();
    }

    /// Map hostnames matching `pattern` onto the configured vhost `vhost`.
    pub fn add_vhost_pattern(&self, pattern: &str, vhost: String) -> Result<(), PatternRejected<String>> {
        self.hostnames.add(pattern, vhost)
    }

    pub fn remove_vhost_pattern(&self, pattern: &str) -> Option<String> {
        self.hostnames.remove(pattern)
    }

    pub fn hostnames(&self) -> &HostnamePatternIndex<String> {
        &self.hostnames
    }

    /// Admission and denial counters as extra Prometheus series.
    pub fn metrics_extra(&self) -> Vec<(String, u64)> {
        let a = self.admission();
        let mut out = vec![
            ("linkguard_connections_processed_total".to_string(), a.connections_processed),
            ("linkguard_connections_denied_total".to_string(), a.connections_denied),
            ("linkguard_connections_current".to_string(), a.connections_current),
        ];
        for d in self.profile_denials() {
            let group = escape_label(&d.group);
            for (kind, v) in [
                ("session", d.session_denied),
                ("sender", d.sender_denied),
                ("receiver", d.receiver_denied),
            ] {
                out.push((format!("linkguard_profile_denials_total{{group=\"{group}\",kind=\"{kind}\"}}"), v));
            }
        }
        out
    }
}

fn bump(conn: &mut ConnectionState, role: LinkRole) {
    match role {
        LinkRole::Sender => conn.n_senders += 1,
        LinkRole::Receiver => conn.n_receivers += 1,
    }
}

fn count_denial(p: &PolicyProfile, role: LinkRole) {
    match role {
        LinkRole::Sender => p.denial_counts().sender_denied(),
        LinkRole::Receiver => p.denial_counts().receiver_denied(),
    }
}

fn log_link(conn: &ConnectionState, dir: &str, link: &str, allowed: bool) {
    if allowed {
        tracing::trace!(conn_id = conn.info.id, user = %conn.info.principal, rhost = %conn.info.remote_host, link = %link, "ALLOW AMQP Attach {dir}");
    } else {
        tracing::info!(conn_id = conn.info.id, user = %conn.info.principal, rhost = %conn.info.remote_host, link = %link, "DENY AMQP Attach {dir}");
    }
}
