//! Shared error type across linkguard crates.

use thiserror::Error;

/// AMQP error conditions used when a connection, session, or link is refused
/// (stable wire vocabulary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    /// A configured count or size limit was hit.
    ResourceLimitExceeded,
    /// The principal is not permitted to do this.
    UnauthorizedAccess,
    /// The gate itself is misconfigured; the request was refused anyway.
    InternalError,
}

impl Condition {
    /// Symbol carried in the AMQP `error.condition` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            Condition::UnauthorizedAccess => "amqp:unauthorized-access",
            Condition::InternalError => "amqp:internal-error",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, GateError>;

/// Unified error type used by core and policy.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("malformed rule: {0}")]
    MalformedRule(String),
    #[error("rule mode '{0}' is not supported by this matcher")]
    UnsupportedMode(char),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
    #[error("identity authority: {0}")]
    Authority(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("config: {0}")]
    Config(String),
    #[error("unsupported config version")]
    UnsupportedVersion,
}

impl GateError {
    /// Map an internal error to the condition sent to the peer.
    pub fn condition(&self) -> Condition {
        match self {
            GateError::MalformedRule(_)
            | GateError::UnsupportedMode(_)
            | GateError::InvalidPattern(_)
            | GateError::Authority(_)
            | GateError::InvalidSettings(_) => Condition::UnauthorizedAccess,
            GateError::Config(_) | GateError::UnsupportedVersion => Condition::InternalError,
        }
    }

    /// Stable short code for logs and JSON surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::MalformedRule(_) => "MALFORMED_RULE",
            GateError::UnsupportedMode(_) => "UNSUPPORTED_MODE",
            GateError::InvalidPattern(_) => "INVALID_PATTERN",
            GateError::Authority(_) => "AUTHORITY",
            GateError::InvalidSettings(_) => "INVALID_SETTINGS",
            GateError::Config(_) => "CONFIG",
            GateError::UnsupportedVersion => "UNSUPPORTED_VERSION",
        }
    }
}
