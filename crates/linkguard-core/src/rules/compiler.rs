//! Rule language compilation.
//!
//! Operators write link-name allow lists as plain CSV where `${user}` marks
//! the spot the connection's principal is substituted:
//!
//! ```text
//! public, tmp-${user}, ${user}.inbox, *
//! ```
//!
//! Internally every token becomes a `(mode, prefix, suffix)` triple and the
//! triples are comma-joined:
//!
//! ```text
//! a,public,,s,tmp-,,p,,.inbox,*,,
//! ```

use crate::error::{GateError, Result};
use crate::pattern_tree::PatternTree;

/// Substitution marker shared with operator config.
pub const USER_SUBST_KEY: &str = "${user}";

/// Trailing wildcard on an allowed name, and the universal-wildcard token.
pub const WILDCARD: char = '*';

const SEP: char = ',';

/// Where the principal goes inside an allowed name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `a`: literal name, no substitution.
    Absent,
    /// `p`: principal + suffix.
    Prefix,
    /// `e`: prefix + principal + suffix.
    Embed,
    /// `s`: prefix + principal.
    Suffix,
    /// `*`: anything goes.
    Wildcard,
}

impl Mode {
    fn from_control(control: &str) -> Option<Self> {
        match control {
            "a" => Some(Mode::Absent),
            "p" => Some(Mode::Prefix),
            "e" => Some(Mode::Embed),
            "s" => Some(Mode::Suffix),
            "*" => Some(Mode::Wildcard),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Mode::Absent => 'a',
            Mode::Prefix => 'p',
            Mode::Embed => 'e',
            Mode::Suffix => 's',
            Mode::Wildcard => '*',
        }
    }
}

/// One `(mode, prefix, suffix)` rule clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triple {
    pub mode: Mode,
    pub prefix: String,
    pub suffix: String,
}

impl Triple {
    /// The concrete name this clause allows for `principal`. `None` for the
    /// universal wildcard.
    pub fn allowed_name(&self, principal: &str) -> Option<String> {
        let fields = match self.mode {
            Mode::Absent => [self.prefix.as_str(), "", ""],
            Mode::Prefix => [principal, self.suffix.as_str(), ""],
            Mode::Embed => [self.prefix.as_str(), principal, self.suffix.as_str()],
            Mode::Suffix => [self.prefix.as_str(), principal, ""],
            Mode::Wildcard => return None,
        };
        let mut name = String::with_capacity(fields.iter().map(|f| f.len()).sum());
        for f in fields {
            name.push_str(f);
        }
        Some(name)
    }

    /// The clause as a tree pattern with the principal left as
    /// [`USER_SUBST_KEY`]. `None` for the universal wildcard.
    pub fn tree_pattern(&self) -> Option<String> {
        self.allowed_name(USER_SUBST_KEY)
    }
}

/// Split a comma-joined triple string into clauses.
///
/// Structural rules: the control field is exactly one byte, the prefix field
/// must be followed by a comma, and the suffix field may run to the end of the
/// string.
pub fn parse_triples(rule: &str) -> Result<Vec<Triple>> {
    let end = rule.len();
    let mut pos = 0;
    let mut out = Vec::new();

    while pos < end {
        let control = field_at(rule, pos);
        if control.len() != 1 {
            return Err(GateError::MalformedRule(format!(
                "control field at byte {pos} must be one character, got '{control}'"
            )));
        }
        let mode = Mode::from_control(control).ok_or_else(|| {
            GateError::MalformedRule(format!("unknown mode '{control}' at byte {pos}"))
        })?;
        pos += control.len() + 1;
        if pos >= end {
            return Err(GateError::MalformedRule(format!(
                "rule ends after control field '{control}'"
            )));
        }

        let prefix = field_at(rule, pos);
        pos += prefix.len() + 1;
        if pos > end {
            return Err(GateError::MalformedRule(format!(
                "rule ends inside the prefix field '{prefix}'"
            )));
        }

        let suffix = field_at(rule, pos);
        pos += suffix.len() + 1;

        out.push(Triple {
            mode,
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        });
    }
    Ok(out)
}

fn field_at(s: &str, pos: usize) -> &str {
    let rest = &s[pos..];
    rest.find(SEP).map_or(rest, |i| &rest[..i])
}

/// Rewrite an operator CSV allow list into triple form.
///
/// A single trailing comma is ignored; whitespace around tokens is trimmed.
pub fn compile_allowed_csv(csv: &str) -> String {
    let csv = csv.strip_suffix(SEP).unwrap_or(csv);
    if csv.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(csv.len() * 2);
    for (i, tok) in csv.split(SEP).enumerate() {
        if i > 0 {
            out.push(SEP);
        }
        let tok = tok.trim();
        match tok.find(USER_SUBST_KEY) {
            Some(0) => {
                out.push_str("p,,");
                out.push_str(&tok[USER_SUBST_KEY.len()..]);
            }
            Some(at) if at + USER_SUBST_KEY.len() == tok.len() => {
                out.push_str("s,");
                out.push_str(&tok[..at]);
                out.push(SEP);
            }
            Some(at) => {
                out.push_str("e,");
                out.push_str(&tok[..at]);
                out.push(SEP);
                out.push_str(&tok[at + USER_SUBST_KEY.len()..]);
            }
            None if tok.len() == 1 && tok.starts_with(WILDCARD) => out.push_str("*,,"),
            None => {
                out.push_str("a,");
                out.push_str(tok);
                out.push(SEP);
            }
        }
    }
    out
}

/// A parsed rule: the triple-form text plus its clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    source: String,
    triples: Vec<Triple>,
}

impl RuleSet {
    /// Parse a rule already in triple form.
    pub fn parse(rule: &str) -> Result<Self> {
        Ok(Self {
            source: rule.to_string(),
            triples: parse_triples(rule)?,
        })
    }

    /// Compile an operator CSV allow list.
    pub fn from_csv(csv: &str) -> Result<Self> {
        Self::parse(&compile_allowed_csv(csv))
    }

    /// The triple-form text this set was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Index every clause into a pattern tree. Presence is the only signal,
    /// so the payload is `()` and duplicate clauses are dropped.
    pub fn to_tree(&self) -> PatternTree<()> {
        let mut tree = PatternTree::new();
        for pattern in self.triples.iter().filter_map(Triple::tree_pattern) {
            let _ = tree.add(&pattern, ());
        }
        tree
    }
}
