//! Tree link-name matching: rewrite the proposed name into canonical form
//! (principal replaced by `${user}`) and probe the pattern tree once per
//! clause.
//!
//! Cost is O(name length) per clause. Embedded substitution (`e`) is not
//! supported here; only the linear matcher handles it.

use crate::error::{GateError, Result};
use crate::pattern_tree::PatternTree;

use super::compiler::{parse_triples, Mode, Triple, USER_SUBST_KEY};

/// Characters that may sit next to a substituted principal.
pub const BOUNDARY_SEPARATORS: [char; 3] = ['.', '/', '-'];

fn is_boundary(c: char) -> bool {
    BOUNDARY_SEPARATORS.contains(&c)
}

/// Decide whether `principal` may attach to `proposed` under `rule` (triple
/// form) whose clauses were indexed into `tree`.
pub fn approve<T>(principal: &str, rule: &str, proposed: &str, tree: &PatternTree<T>) -> Result<bool> {
    if proposed.is_empty() || rule.is_empty() {
        return Ok(false);
    }
    let triples = parse_triples(rule)?;
    approve_triples(principal, &triples, proposed, tree)
}

/// Same as [`approve`] over already-parsed clauses.
pub fn approve_triples<T>(
    principal: &str,
    triples: &[Triple],
    proposed: &str,
    tree: &PatternTree<T>,
) -> Result<bool> {
    if proposed.is_empty() {
        return Ok(false);
    }
    // A literal `${user}` in the name would collide with the canonical keys
    // of substitution clauses; only the universal wildcard can admit it.
    if proposed.contains(USER_SUBST_KEY) {
        return Ok(triples.iter().any(|t| matches!(t.mode, Mode::Wildcard)));
    }
    for triple in triples {
        let key = match triple.mode {
            Mode::Wildcard => return Ok(true),
            Mode::Absent => proposed.to_string(),
            Mode::Prefix => match prefix_key(principal, proposed) {
                Some(k) => k,
                None => continue,
            },
            Mode::Suffix => match suffix_key(principal, proposed) {
                Some(k) => k,
                None => continue,
            },
            Mode::Embed => return Err(GateError::UnsupportedMode(Mode::Embed.as_char())),
        };
        if tree.matches(&key) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `bob.inbox` -> `${user}.inbox`; `bob` -> `${user}`; `bobby` -> none.
fn prefix_key(principal: &str, proposed: &str) -> Option<String> {
    let rest = proposed.strip_prefix(principal)?;
    if rest.chars().next().is_some_and(|c| !is_boundary(c)) {
        return None;
    }
    let mut key = String::with_capacity(USER_SUBST_KEY.len() + rest.len());
    key.push_str(USER_SUBST_KEY);
    key.push_str(rest);
    Some(key)
}

/// `deep-bob` -> `deep-${user}`; `deepbob` -> none.
fn suffix_key(principal: &str, proposed: &str) -> Option<String> {
    let head = proposed.strip_suffix(principal)?;
    if !head.chars().next_back().is_some_and(is_boundary) {
        return None;
    }
    let mut key = String::with_capacity(head.len() + USER_SUBST_KEY.len());
    key.push_str(head);
    key.push_str(USER_SUBST_KEY);
    Some(key)
}
