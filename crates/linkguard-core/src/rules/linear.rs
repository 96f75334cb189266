//! Linear link-name matching: build each clause's allowed name for the
//! principal and compare it with the proposed name.
//!
//! Cost is O(clauses x name length).

use super::compiler::{parse_triples, Mode, Triple, WILDCARD};

/// Decide whether `principal` may attach to `proposed` under `rule` (triple
/// form). A malformed rule denies.
pub fn approve(principal: &str, rule: &str, proposed: &str) -> bool {
    if proposed.is_empty() || rule.is_empty() {
        return false;
    }
    match parse_triples(rule) {
        Ok(triples) => approve_triples(principal, &triples, proposed),
        Err(e) => {
            tracing::warn!(rule = %rule, error = %e, "link name rule rejected; denying");
            false
        }
    }
}

/// Same as [`approve`] over already-parsed clauses. First match wins.
pub fn approve_triples(principal: &str, triples: &[Triple], proposed: &str) -> bool {
    if proposed.is_empty() {
        return false;
    }
    triples.iter().any(|t| clause_allows(principal, t, proposed))
}

fn clause_allows(principal: &str, triple: &Triple, proposed: &str) -> bool {
    if triple.mode == Mode::Wildcard {
        return true;
    }
    let Some(allowed) = triple.allowed_name(principal) else {
        return false;
    };
    match allowed.strip_suffix(WILDCARD) {
        // `tmp*` admits `tmp`, `tmp-x`, ...
        Some(stem) => proposed.starts_with(stem),
        None => proposed == allowed,
    }
}
