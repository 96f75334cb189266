//! Identity authority seam.
//!
//! The authority maps an authenticated principal on a vhost to a named policy
//! profile and supplies that profile's settings. It is not assumed to be
//! reentrant: the engine funnels every call through [`SerializedAuthority`],
//! which holds one async lock for the duration of a single call.

pub mod local;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use linkguard_core::error::Result;

use crate::obs::metrics::PolicyMetrics;

pub use local::LocalAuthority;

/// Settings bag describing one profile (`maxSessions`, `sources`, ...).
pub type SettingsBag = serde_json::Map<String, serde_json::Value>;

/// Everything the authority gets to see when resolving a connection.
#[derive(Debug, Clone, Copy)]
pub struct UserLookup<'a> {
    pub principal: &'a str,
    pub remote_ip: &'a str,
    pub vhost: &'a str,
    pub connection_name: &'a str,
    pub connection_id: u64,
}

/// Where `lookup_user` placed a connection.
///
/// `vhost` is the configured vhost the authority matched, not the hostname it
/// was asked about: every hostname that falls back to `$default` resolves to
/// `$default` here. The engine keys compiled profiles, denial counters and
/// per-vhost gauges on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProfile {
    pub vhost: String,
    pub profile: String,
}

impl ResolvedProfile {
    pub fn new(vhost: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            vhost: vhost.into(),
            profile: profile.into(),
        }
    }
}

/// External service resolving identities to profiles.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// Vhost and profile for this connection, or `None` to refuse it.
    async fn lookup_user(&self, req: &UserLookup<'_>) -> Result<Option<ResolvedProfile>>;

    /// Settings for a profile previously returned by `lookup_user`, asked for
    /// under the vhost it was resolved on.
    async fn lookup_settings(&self, vhost: &str, profile: &str) -> Result<SettingsBag>;

    /// A connection accepted by `lookup_user` went away. Best-effort.
    async fn on_close(&self, connection_id: u64) -> Result<()>;
}

/// One-call-at-a-time wrapper that also records call latency and failures.
pub(crate) struct SerializedAuthority {
    inner: Arc<dyn IdentityAuthority>,
    lock: tokio::sync::Mutex<()>,
    metrics: Arc<PolicyMetrics>,
}

impl SerializedAuthority {
    pub(crate) fn new(inner: Arc<dyn IdentityAuthority>, metrics: Arc<PolicyMetrics>) -> Self {
        Self {
            inner,
            lock: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    fn record<T>(&self, call: &str, started: Instant, res: &Result<T>) {
        self.metrics
            .authority_latency
            .observe(&[("call", call)], started.elapsed());
        if let Err(e) = res {
            self.metrics
                .authority_failures
                .inc(&[("call", call), ("code", e.code())]);
        }
    }

    pub(crate) async fn lookup_user(&self, req: &UserLookup<'_>) -> Result<Option<ResolvedProfile>> {
        let _serial = self.lock.lock().await;
        let started = Instant::now();
        let res = self.inner.lookup_user(req).await;
        self.record("lookup_user", started, &res);
        res
    }

    pub(crate) async fn lookup_settings(&self, vhost: &str, profile: &str) -> Result<SettingsBag> {
        let _serial = self.lock.lock().await;
        let started = Instant::now();
        let res = self.inner.lookup_settings(vhost, profile).await;
        self.record("lookup_settings", started, &res);
        res
    }

    pub(crate) async fn on_close(&self, connection_id: u64) -> Result<()> {
        let _serial = self.lock.lock().await;
        let started = Instant::now();
        let res = self.inner.on_close(connection_id).await;
        self.record("on_close", started, &res);
        res
    }
}
