//! linkguard policy library entry.
//!
//! This crate wires the admission gate, hostname pattern index, profile cache,
//! identity authority, and the connection lifecycle engine into one
//! `PolicyEngine` that a router calls at socket accept, AMQP Open, Begin,
//! Attach, and close. The ops HTTP surface and the binary (`main.rs`) sit on
//! top of it.

pub mod admission;
pub mod app_state;
pub mod authority;
pub mod config;
pub mod connection;
pub mod engine;
pub mod hostname;
pub mod obs;
pub mod ops;
pub mod profile;
pub mod router;

pub use admission::{AdmissionGate, AdmissionPermit, AdmissionSnapshot};
pub use authority::{IdentityAuthority, LocalAuthority, ResolvedProfile, SettingsBag, UserLookup};
pub use connection::{AuthzGrants, ConnectionInfo, ConnectionRole, ConnectionState, LinkRole, Phase, Terminus};
pub use engine::{Denial, LinkDecision, OpenDecision, PolicyEngine, SessionDecision, TransportLimits};
pub use hostname::{HostnamePatternIndex, PatternRejected};
pub use profile::{DenialCounts, DenialSnapshot, PolicyProfile};
