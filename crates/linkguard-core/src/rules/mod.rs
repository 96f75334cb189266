//! Link-name rules: compiler plus the two matching strategies.
//!
//! Both strategies answer the same question, "may this principal attach a
//! link to this address?", and must agree wherever both support the clause
//! mode. The tree strategy trades the embed mode for a single indexed lookup
//! per clause.

pub mod compiler;
pub mod linear;
pub mod tree;

pub use compiler::{compile_allowed_csv, parse_triples, Mode, RuleSet, Triple, USER_SUBST_KEY};

use crate::error::Result;
use crate::pattern_tree::PatternTree;

/// Which strategy a compiled matcher uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Linear,
    Tree,
}

impl MatcherKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MatcherKind::Linear => "linear",
            MatcherKind::Tree => "tree",
        }
    }
}

/// Compiled link-name matcher for one direction (sources or targets).
#[derive(Debug, Default)]
pub enum LinkMatcher {
    /// No rule, or a rule that failed to compile.
    #[default]
    DenyAll,
    Linear(RuleSet),
    Tree {
        rules: RuleSet,
        tree: PatternTree<()>,
    },
}

impl LinkMatcher {
    /// Compile an operator CSV allow list. An empty list yields `DenyAll`;
    /// a malformed one is an error the caller must turn into `DenyAll`.
    pub fn compile(kind: MatcherKind, csv: &str) -> Result<Self> {
        let rules = RuleSet::from_csv(csv)?;
        if rules.is_empty() {
            return Ok(LinkMatcher::DenyAll);
        }
        Ok(match kind {
            MatcherKind::Linear => LinkMatcher::Linear(rules),
            MatcherKind::Tree => {
                let tree = rules.to_tree();
                LinkMatcher::Tree { rules, tree }
            }
        })
    }

    pub fn kind(&self) -> Option<MatcherKind> {
        match self {
            LinkMatcher::DenyAll => None,
            LinkMatcher::Linear(_) => Some(MatcherKind::Linear),
            LinkMatcher::Tree { .. } => Some(MatcherKind::Tree),
        }
    }

    pub fn is_deny_all(&self) -> bool {
        matches!(self, LinkMatcher::DenyAll)
    }

    /// Decide whether `principal` may use `proposed`.
    ///
    /// Only the tree strategy can fail (on an embed clause); callers deny on
    /// error.
    pub fn approve(&self, principal: &str, proposed: &str) -> Result<bool> {
        match self {
            LinkMatcher::DenyAll => Ok(false),
            LinkMatcher::Linear(rules) => Ok(linear::approve_triples(principal, rules.triples(), proposed)),
            LinkMatcher::Tree { rules, tree } => tree::approve_triples(principal, rules.triples(), proposed, tree),
        }
    }
}
