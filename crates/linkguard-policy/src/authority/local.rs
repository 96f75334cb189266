//! Config-driven identity authority.
//!
//! Each configured vhost lists user groups; a group name is the profile name
//! handed back to the engine and its `settings` map is the profile's settings
//! bag. Resolution order for a user: explicit membership, then a group listing
//! `*`, then the `$default` group. An unknown vhost falls back to the
//! `$default` vhost when one is configured.
//!
//! Per-vhost and per-user connection ceilings are enforced at lookup time and
//! released again on close.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use linkguard_core::error::{GateError, Result};

use super::{IdentityAuthority, ResolvedProfile, SettingsBag, UserLookup};
use crate::config::schema::VhostConfig;

/// Name of the fallback vhost and of the fallback group inside a vhost.
pub const DEFAULT_NAME: &str = "$default";

/// Group member entry matching any user.
pub const ANY_USER: &str = "*";

#[derive(Debug)]
struct VhostRules {
    max_connections: u32,
    max_connections_per_user: u32,
    members: HashMap<String, String>,
    any_user_group: Option<String>,
    groups: HashMap<String, SettingsBag>,
}

impl VhostRules {
    fn from_config(cfg: &VhostConfig) -> Result<Self> {
        let mut members = HashMap::new();
        let mut any_user_group = None;
        for (group, g) in &cfg.groups {
            for user in &g.users {
                let user = user.trim();
                if user == ANY_USER {
                    if let Some(prev) = any_user_group.replace(group.clone()) {
                        return Err(GateError::Config(format!(
                            "vhost {}: groups {prev} and {group} both list '*'",
                            cfg.hostname
                        )));
                    }
                } else if let Some(prev) = members.insert(user.to_string(), group.clone()) {
                    return Err(GateError::Config(format!(
                        "vhost {}: user {user} is in both {prev} and {group}",
                        cfg.hostname
                    )));
                }
            }
        }
        Ok(Self {
            max_connections: cfg.max_connections,
            max_connections_per_user: cfg.max_connections_per_user,
            members,
            any_user_group,
            groups: cfg
                .groups
                .iter()
                .map(|(name, g)| (name.clone(), g.settings.clone()))
                .collect(),
        })
    }

    fn group_for(&self, user: &str) -> Option<&str> {
        self.members
            .get(user)
            .or(self.any_user_group.as_ref())
            .map(String::as_str)
            .or_else(|| self.groups.contains_key(DEFAULT_NAME).then_some(DEFAULT_NAME))
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    vhost: String,
    user: String,
}

/// Identity authority backed by the `vhosts` config section.
#[derive(Debug)]
pub struct LocalAuthority {
    vhosts: HashMap<String, VhostRules>,
    live: DashMap<u64, Tracked>,
    per_vhost: DashMap<String, u32>,
    per_user: DashMap<(String, String), u32>,
}

impl LocalAuthority {
    pub fn new(vhosts: &[VhostConfig]) -> Result<Self> {
        let mut map = HashMap::with_capacity(vhosts.len());
        for v in vhosts {
            map.insert(v.hostname.clone(), VhostRules::from_config(v)?);
        }
        Ok(Self {
            vhosts: map,
            live: DashMap::new(),
            per_vhost: DashMap::new(),
            per_user: DashMap::new(),
        })
    }

    /// Configured vhost for `vhost`, falling back to `$default`.
    fn resolve(&self, vhost: &str) -> Option<(&str, &VhostRules)> {
        self.vhosts
            .get_key_value(vhost)
            .or_else(|| self.vhosts.get_key_value(DEFAULT_NAME))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Connections currently counted against `vhost`.
    pub fn connections(&self, vhost: &str) -> u32 {
        self.per_vhost.get(vhost).map_or(0, |c| *c)
    }

    /// Connections currently counted against `user` on `vhost`.
    pub fn user_connections(&self, vhost: &str, user: &str) -> u32 {
        self.per_user
            .get(&(vhost.to_string(), user.to_string()))
            .map_or(0, |c| *c)
    }
}

#[async_trait]
impl IdentityAuthority for LocalAuthority {
    async fn lookup_user(&self, req: &UserLookup<'_>) -> Result<Option<ResolvedProfile>> {
        let Some((vhost, rules)) = self.resolve(req.vhost) else {
            tracing::info!(vhost = %req.vhost, user = %req.principal, "no vhost policy configured");
            return Ok(None);
        };

        let current = self.connections(vhost);
        if rules.max_connections > 0 && current >= rules.max_connections {
            tracing::info!(vhost = %vhost, current, limit = rules.max_connections, "vhost connection limit reached");
            return Ok(None);
        }
        let user_current = self.user_connections(vhost, req.principal);
        if rules.max_connections_per_user > 0 && user_current >= rules.max_connections_per_user {
            tracing::info!(
                vhost = %vhost,
                user = %req.principal,
                current = user_current,
                limit = rules.max_connections_per_user,
                "per-user connection limit reached"
            );
            return Ok(None);
        }

        let Some(group) = rules.group_for(req.principal) else {
            tracing::info!(vhost = %vhost, user = %req.principal, "user is in no group");
            return Ok(None);
        };

        *self.per_vhost.entry(vhost.to_string()).or_insert(0) += 1;
        *self
            .per_user
            .entry((vhost.to_string(), req.principal.to_string()))
            .or_insert(0) += 1;
        self.live.insert(
            req.connection_id,
            Tracked {
                vhost: vhost.to_string(),
                user: req.principal.to_string(),
            },
        );
        tracing::debug!(
            conn_id = req.connection_id,
            vhost = %vhost,
            user = %req.principal,
            group = %group,
            "user resolved to group"
        );
        Ok(Some(ResolvedProfile::new(vhost, group)))
    }

    async fn lookup_settings(&self, vhost: &str, profile: &str) -> Result<SettingsBag> {
        let (resolved, rules) = self
            .resolve(vhost)
            .ok_or_else(|| GateError::Authority(format!("unknown vhost {vhost}")))?;
        rules
            .groups
            .get(profile)
            .cloned()
            .ok_or_else(|| GateError::Authority(format!("vhost {resolved} has no group {profile}")))
    }

    async fn on_close(&self, connection_id: u64) -> Result<()> {
        let Some((_, t)) = self.live.remove(&connection_id) else {
            return Err(GateError::Authority(format!("connection {connection_id} is not tracked")));
        };
        if let Some(mut c) = self.per_vhost.get_mut(&t.vhost) {
            *c = c.saturating_sub(1);
        }
        if let Some(mut c) = self.per_user.get_mut(&(t.vhost, t.user)) {
            *c = c.saturating_sub(1);
        }
        Ok(())
    }
}
