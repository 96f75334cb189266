//! Top-level facade crate for linkguard.
//!
//! Re-exports the rule/pattern core and the policy engine so users can depend
//! on a single crate.

pub mod core {
    pub use linkguard_core::*;
}

pub mod policy {
    pub use linkguard_policy::*;
}
