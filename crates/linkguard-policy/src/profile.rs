//! Policy profiles: named bundles of limits and link-name rules.
//!
//! A profile is compiled once from the settings bag the identity authority
//! returns, published into the cache, and shared read-only by every connection
//! that resolves to it. Denial counters live beside the profiles so they
//! survive cache invalidation on reconfiguration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use linkguard_core::error::{GateError, Result};
use linkguard_core::rules::{LinkMatcher, MatcherKind};

use crate::authority::SettingsBag;
use crate::connection::AuthzGrants;

/// Keys a settings bag may carry.
pub const SETTINGS_KEYS: [&str; 15] = [
    "maxFrameSize",
    "maxSessionWindow",
    "maxSessions",
    "maxSenders",
    "maxReceivers",
    "allowAnonymousSender",
    "allowDynamicSource",
    "allowUserIdProxy",
    "allowWaypointLinks",
    "allowDynamicLinkRoutes",
    "sources",
    "targets",
    "sourcePattern",
    "targetPattern",
    "denialCounts",
];

/// Per-profile denial telemetry. Advisory: relaxed atomics, no ordering.
#[derive(Debug, Default)]
pub struct DenialCounts {
    session_denied: AtomicU64,
    sender_denied: AtomicU64,
    receiver_denied: AtomicU64,
}

impl DenialCounts {
    pub fn session_denied(&self) {
        self.session_denied.fetch_add(1, Ordering::Relaxed);
    }
    pub fn sender_denied(&self) {
        self.sender_denied.fetch_add(1, Ordering::Relaxed);
    }
    pub fn receiver_denied(&self) {
        self.receiver_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, group: &str) -> DenialSnapshot {
        DenialSnapshot {
            group: group.to_string(),
            session_denied: self.session_denied.load(Ordering::Relaxed),
            sender_denied: self.sender_denied.load(Ordering::Relaxed),
            receiver_denied: self.receiver_denied.load(Ordering::Relaxed),
        }
    }
}

/// Denial counters of one counter group, as exposed to management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialSnapshot {
    pub group: String,
    pub session_denied: u64,
    pub sender_denied: u64,
    pub receiver_denied: u64,
}

/// Compiled, immutable profile.
#[derive(Debug)]
pub struct PolicyProfile {
    pub vhost: String,
    pub name: String,

    /// 0 = unlimited / transport default, for all five.
    pub max_frame_size: u32,
    pub max_session_window: u32,
    pub max_sessions: u32,
    pub max_senders: u32,
    pub max_receivers: u32,

    pub allow_anonymous_sender: bool,
    pub allow_dynamic_source: bool,
    pub allow_user_id_proxy: bool,
    pub allow_waypoint_links: bool,
    pub allow_dynamic_link_routes: bool,

    /// Raw operator CSV, kept for derivation and display.
    pub sources: Option<String>,
    pub targets: Option<String>,
    pub source_pattern: Option<String>,
    pub target_pattern: Option<String>,

    source_matcher: LinkMatcher,
    target_matcher: LinkMatcher,

    counts_group: String,
    denial_counts: Arc<DenialCounts>,
}

impl PolicyProfile {
    /// Compile a profile from an authority settings bag.
    ///
    /// `grants` from an earlier authorization layer win over the bag for the
    /// fields they set. `counts_for` maps a counter-group name to its shared
    /// counters.
    pub fn from_settings(
        vhost: &str,
        name: &str,
        bag: &SettingsBag,
        grants: &AuthzGrants,
        counts_for: impl FnOnce(&str) -> Arc<DenialCounts>,
    ) -> Result<Self> {
        let counts_group = opt_string(bag, "denialCounts")?
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| format!("{vhost}/{name}"));

        let sources = grants.sources.clone().or(opt_string(bag, "sources")?);
        let targets = grants.targets.clone().or(opt_string(bag, "targets")?);
        let source_pattern = opt_string(bag, "sourcePattern")?;
        let target_pattern = opt_string(bag, "targetPattern")?;

        let source_matcher = compile_matcher(vhost, name, "sources", source_pattern.as_deref(), sources.as_deref());
        let target_matcher = compile_matcher(vhost, name, "targets", target_pattern.as_deref(), targets.as_deref());

        Ok(Self {
            vhost: vhost.to_string(),
            name: name.to_string(),
            max_frame_size: opt_u32(bag, "maxFrameSize")?,
            max_session_window: opt_u32(bag, "maxSessionWindow")?,
            max_sessions: opt_u32(bag, "maxSessions")?,
            max_senders: opt_u32(bag, "maxSenders")?,
            max_receivers: opt_u32(bag, "maxReceivers")?,
            allow_anonymous_sender: grants.allow_anonymous_sender
                || opt_bool(bag, "allowAnonymousSender", false)?,
            allow_dynamic_source: grants.allow_dynamic_source || opt_bool(bag, "allowDynamicSource", false)?,
            allow_user_id_proxy: opt_bool(bag, "allowUserIdProxy", false)?,
            allow_waypoint_links: opt_bool(bag, "allowWaypointLinks", true)?,
            allow_dynamic_link_routes: opt_bool(bag, "allowDynamicLinkRoutes", true)?,
            sources,
            targets,
            source_pattern,
            target_pattern,
            source_matcher,
            target_matcher,
            denial_counts: counts_for(&counts_group),
            counts_group,
        })
    }

    /// Connection-specific copy with earlier grants layered on top. Shares
    /// this profile's denial counters.
    pub fn with_grants(&self, grants: &AuthzGrants) -> Self {
        let sources = grants.sources.clone().or_else(|| self.sources.clone());
        let targets = grants.targets.clone().or_else(|| self.targets.clone());
        Self {
            vhost: self.vhost.clone(),
            name: self.name.clone(),
            max_frame_size: self.max_frame_size,
            max_session_window: self.max_session_window,
            max_sessions: self.max_sessions,
            max_senders: self.max_senders,
            max_receivers: self.max_receivers,
            allow_anonymous_sender: self.allow_anonymous_sender || grants.allow_anonymous_sender,
            allow_dynamic_source: self.allow_dynamic_source || grants.allow_dynamic_source,
            allow_user_id_proxy: self.allow_user_id_proxy,
            allow_waypoint_links: self.allow_waypoint_links,
            allow_dynamic_link_routes: self.allow_dynamic_link_routes,
            source_matcher: compile_matcher(
                &self.vhost,
                &self.name,
                "sources",
                self.source_pattern.as_deref(),
                sources.as_deref(),
            ),
            target_matcher: compile_matcher(
                &self.vhost,
                &self.name,
                "targets",
                self.target_pattern.as_deref(),
                targets.as_deref(),
            ),
            sources,
            targets,
            source_pattern: self.source_pattern.clone(),
            target_pattern: self.target_pattern.clone(),
            counts_group: self.counts_group.clone(),
            denial_counts: Arc::clone(&self.denial_counts),
        }
    }

    /// Matcher for receiver sources.
    pub fn source_matcher(&self) -> &LinkMatcher {
        &self.source_matcher
    }

    /// Matcher for sender targets.
    pub fn target_matcher(&self) -> &LinkMatcher {
        &self.target_matcher
    }

    pub fn denial_counts(&self) -> &DenialCounts {
        &self.denial_counts
    }

    pub fn counts_group(&self) -> &str {
        &self.counts_group
    }
}

/// A pattern rule selects the tree matcher, else a plain rule selects the
/// linear matcher, else nothing is allowed. Compile failures deny everything.
fn compile_matcher(
    vhost: &str,
    profile: &str,
    direction: &str,
    pattern: Option<&str>,
    plain: Option<&str>,
) -> LinkMatcher {
    let (kind, csv) = match (pattern.filter(|p| !p.is_empty()), plain) {
        (Some(p), _) => (MatcherKind::Tree, p),
        (None, Some(s)) => (MatcherKind::Linear, s),
        (None, None) => return LinkMatcher::DenyAll,
    };
    match LinkMatcher::compile(kind, csv) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(
                vhost = %vhost,
                profile = %profile,
                direction = %direction,
                matcher = kind.as_str(),
                error = %e,
                "link name rule failed to compile; all {direction} denied"
            );
            LinkMatcher::DenyAll
        }
    }
}

fn opt_u32(bag: &SettingsBag, key: &str) -> Result<u32> {
    match bag.get(key) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| GateError::InvalidSettings(format!("{key} must be a non-negative 32-bit integer, got {n}"))),
        Some(other) => Err(GateError::InvalidSettings(format!("{key} must be an integer, got {other}"))),
    }
}

fn opt_bool(bag: &SettingsBag, key: &str, default: bool) -> Result<bool> {
    match bag.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(GateError::InvalidSettings(format!("{key} must be a boolean, got {other}"))),
    }
}

fn opt_string(bag: &SettingsBag, key: &str) -> Result<Option<String>> {
    match bag.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(GateError::InvalidSettings(format!("{key} must be a string, got {other}"))),
    }
}

/// Compiled profiles keyed by `(vhost, profile name)` plus the denial counter
/// groups they point at.
///
/// Compilation happens outside the map; when two connections race on the
/// same cold key both compile and the first publish wins.
#[derive(Default)]
pub struct ProfileCache {
    profiles: DashMap<(String, String), Arc<PolicyProfile>>,
    counts: DashMap<String, Arc<DenialCounts>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, vhost: &str, name: &str) -> Option<Arc<PolicyProfile>> {
        self.profiles
            .get(&(vhost.to_string(), name.to_string()))
            .map(|r| Arc::clone(r.value()))
    }

    /// Shared counters for `group`, created on first use.
    pub fn counts_for(&self, group: &str) -> Arc<DenialCounts> {
        let entry = self.counts.entry(group.to_string()).or_default();
        Arc::clone(entry.value())
    }

    /// Compile and publish, or return whatever got published first.
    pub fn publish(&self, vhost: &str, name: &str, bag: &SettingsBag) -> Result<Arc<PolicyProfile>> {
        let profile = PolicyProfile::from_settings(vhost, name, bag, &AuthzGrants::default(), |g| self.counts_for(g))?;
        let entry = self
            .profiles
            .entry((vhost.to_string(), name.to_string()))
            .or_insert_with(|| Arc::new(profile));
        Ok(Arc::clone(entry.value()))
    }

    /// Forget compiled profiles (counters are kept).
    pub fn invalidate(&self) {
        self.profiles.clear();
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Snapshot of every counter group, sorted by group name.
    pub fn denials(&self) -> Vec<DenialSnapshot> {
        let mut out: Vec<DenialSnapshot> = self.counts.iter().map(|r| r.value().snapshot(r.key())).collect();
        out.sort_by(|a, b| a.group.cmp(&b.group));
        out
    }
}
