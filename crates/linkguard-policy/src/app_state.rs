//! Shared application state for the policy service.
//!
//! Builds the engine from config, installs the local authority unless the
//! caller brings its own, and registers vhost hostname patterns.

use std::sync::Arc;

use linkguard_core::error::{GateError, Result};

use crate::authority::{IdentityAuthority, LocalAuthority};
use crate::config::PolicyConfig;
use crate::engine::PolicyEngine;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: PolicyConfig,
    engine: Arc<PolicyEngine>,
}

impl AppState {
    /// Build state with the config-driven [`LocalAuthority`].
    pub fn new(cfg: PolicyConfig) -> Result<Self> {
        let authority = Arc::new(LocalAuthority::new(&cfg.vhosts)?);
        Self::with_authority(cfg, authority)
    }

    /// Build state around an externally provided identity authority.
    pub fn with_authority(cfg: PolicyConfig, authority: Arc<dyn IdentityAuthority>) -> Result<Self> {
        let engine = PolicyEngine::new(cfg.policy.clone(), authority);

        if cfg.policy.enable_vhost_name_patterns {
            for v in &cfg.vhosts {
                engine
                    .add_vhost_pattern(&v.hostname, v.hostname.clone())
                    .map_err(|rej| {
                        GateError::Config(format!(
                            "vhost pattern {} collides with {}",
                            rej.pattern,
                            rej.existing.as_deref().unwrap_or("an unusable index")
                        ))
                    })?;
            }
        }

        tracing::info!(
            vhosts = cfg.vhosts.len(),
            max_connections = cfg.policy.max_connections,
            vhost_policy = cfg.policy.enable_vhost_policy,
            name_patterns = cfg.policy.enable_vhost_name_patterns,
            "policy engine ready"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                cfg,
                engine: Arc::new(engine),
            }),
        })
    }

    pub fn cfg(&self) -> &PolicyConfig {
        &self.inner.cfg
    }

    pub fn engine(&self) -> Arc<PolicyEngine> {
        Arc::clone(&self.inner.engine)
    }
}
