//! Policy config loader (strict parsing).

pub mod schema;

use std::fs;

use linkguard_core::error::{GateError, Result};

pub use schema::{GroupConfig, OpsSection, PolicyConfig, PolicySection, VhostConfig};

pub fn load_from_file(path: &str) -> Result<PolicyConfig> {
    let s = fs::read_to_string(path).map_err(|e| GateError::Config(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<PolicyConfig> {
    let cfg: PolicyConfig =
        serde_yaml::from_str(s).map_err(|e| GateError::Config(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
