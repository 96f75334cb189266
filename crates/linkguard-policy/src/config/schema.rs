use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use linkguard_core::error::{GateError, Result};
use linkguard_core::pattern_tree;

use crate::authority::SettingsBag;
use crate::connection::AuthzGrants;
use crate::profile::{DenialCounts, PolicyProfile, SETTINGS_KEYS};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub version: u32,

    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub ops: OpsSection,

    #[serde(default)]
    pub vhosts: Vec<VhostConfig>,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(GateError::UnsupportedVersion);
        }

        self.policy.validate()?;

        let mut seen = HashSet::new();
        for v in &self.vhosts {
            v.validate()?;
            // `a/b` and `a.b` are the same pattern once normalized
            if !seen.insert(pattern_tree::normalize(&v.hostname)) {
                return Err(GateError::Config(format!("vhost {} is configured twice", v.hostname)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    /// Global ceiling on concurrently admitted sockets.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Consult the identity authority at Open.
    #[serde(default)]
    pub enable_vhost_policy: bool,

    /// Map Open hostnames onto configured vhost patterns first.
    #[serde(default)]
    pub enable_vhost_name_patterns: bool,

    /// Session incoming window (bytes) when the profile sets none.
    #[serde(default = "default_session_capacity")]
    pub default_session_capacity: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            enable_vhost_policy: false,
            enable_vhost_name_patterns: false,
            default_session_capacity: default_session_capacity(),
        }
    }
}

impl PolicySection {
    pub fn validate(&self) -> Result<()> {
        if self.default_session_capacity == 0 {
            return Err(GateError::Config(
                "policy.default_session_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_connections() -> u32 {
    65535
}
fn default_session_capacity() -> u64 {
    // 100 frames of 16 KiB
    1_638_400
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpsSection {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for OpsSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:9090".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VhostConfig {
    /// Vhost name or hostname pattern (`*.example.com`), or `$default`.
    pub hostname: String,

    /// 0 = unlimited.
    #[serde(default)]
    pub max_connections: u32,

    /// 0 = unlimited.
    #[serde(default)]
    pub max_connections_per_user: u32,

    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

impl VhostConfig {
    pub fn validate(&self) -> Result<()> {
        pattern_tree::validate(&self.hostname)
            .map_err(|e| GateError::Config(format!("vhost hostname: {e}")))?;
        for (name, g) in &self.groups {
            g.validate(&self.hostname, name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    #[serde(default)]
    pub users: Vec<String>,

    #[serde(default)]
    pub settings: SettingsBag,
}

impl GroupConfig {
    /// Reject unknown setting keys and settings that would not compile.
    pub fn validate(&self, vhost: &str, group: &str) -> Result<()> {
        if let Some(key) = self.settings.keys().find(|k| !SETTINGS_KEYS.contains(&k.as_str())) {
            return Err(GateError::Config(format!(
                "vhost {vhost} group {group}: unknown setting {key}"
            )));
        }
        PolicyProfile::from_settings(vhost, group, &self.settings, &AuthzGrants::default(), |_| {
            std::sync::Arc::new(DenialCounts::default())
        })
        .map_err(|e| GateError::Config(format!("vhost {vhost} group {group}: {e}")))?;
        Ok(())
    }
}
