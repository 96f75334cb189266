//! Address pattern tree.
//!
//! Patterns and keys are split into tokens on `.` or `/`. Inside a pattern:
//! - `*` matches exactly one token,
//! - `#` matches zero or more tokens,
//! - anything else must equal the key token.
//!
//! Patterns are normalized before they are stored: runs of `#` collapse into
//! one, and `#` followed by `*` is reordered to `*` then `#` (both spellings
//! match the same keys). Two patterns that normalize to the same form are
//! duplicates.
//!
//! Retrieval returns the best match: at every level a literal token beats `*`,
//! and `*` beats `#`.

use std::collections::{HashMap, HashSet};

use crate::error::{GateError, Result};

/// Characters that split a pattern or key into tokens.
pub const TOKEN_SEPARATORS: [char; 2] = ['.', '/'];

const STAR: &str = "*";
const HASH: &str = "#";

/// Returns true if `c` separates address tokens.
pub fn is_token_separator(c: char) -> bool {
    TOKEN_SEPARATORS.contains(&c)
}

fn tokens(s: &str) -> Vec<&str> {
    s.split(is_token_separator).collect()
}

/// Normalized form of `pattern` (tokens joined with `.`).
pub fn normalize(pattern: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for tok in tokens(pattern) {
        match tok {
            HASH if out.last() == Some(&HASH) => {}
            STAR if out.last() == Some(&HASH) => {
                // keep the trailing `#` last; every `*` slides in front of it
                let at = out.len() - 1;
                out.insert(at, STAR);
            }
            _ => out.push(tok),
        }
    }
    out.join(".")
}

/// Check that `pattern` is storable: non-empty with no empty tokens.
pub fn validate(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(GateError::InvalidPattern("pattern is empty".into()));
    }
    if tokens(pattern).iter().any(|t| t.is_empty()) {
        return Err(GateError::InvalidPattern(format!("'{pattern}' has an empty token")));
    }
    Ok(())
}

struct Node<T> {
    literal: HashMap<String, Node<T>>,
    star: Option<Box<Node<T>>>,
    hash: Option<Box<Node<T>>>,
    entry: Option<(String, T)>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literal: HashMap::new(),
            star: None,
            hash: None,
            entry: None,
        }
    }
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        self.entry.is_none() && self.literal.is_empty() && self.star.is_none() && self.hash.is_none()
    }

    fn child_mut(&mut self, tok: &str) -> &mut Node<T> {
        match tok {
            STAR => self.star.get_or_insert_with(Box::default),
            HASH => self.hash.get_or_insert_with(Box::default),
            _ => self.literal.entry(tok.to_string()).or_default(),
        }
    }

    fn child(&self, tok: &str) -> Option<&Node<T>> {
        match tok {
            STAR => self.star.as_deref(),
            HASH => self.hash.as_deref(),
            _ => self.literal.get(tok),
        }
    }

    /// Remove the entry at `path`, pruning nodes left empty behind it.
    fn remove(&mut self, path: &[&str]) -> Option<T> {
        let Some((first, rest)) = path.split_first() else {
            return self.entry.take().map(|(_, v)| v);
        };
        let (removed, prune) = match *first {
            STAR => {
                let child = self.star.as_deref_mut()?;
                let removed = child.remove(rest);
                (removed, child.is_empty())
            }
            HASH => {
                let child = self.hash.as_deref_mut()?;
                let removed = child.remove(rest);
                (removed, child.is_empty())
            }
            tok => {
                let child = self.literal.get_mut(tok)?;
                let removed = child.remove(rest);
                (removed, child.is_empty())
            }
        };
        if prune {
            match *first {
                STAR => self.star = None,
                HASH => self.hash = None,
                tok => {
                    self.literal.remove(tok);
                }
            }
        }
        removed
    }

    /// Best entry matching `key[at..]` below this node.
    ///
    /// The search order is fixed, so a (node, offset) pair that failed once
    /// fails every time; `dead` records those pairs and keeps `#` backtracking
    /// polynomial in the key length.
    fn best<'a>(&'a self, key: &[&str], at: usize, dead: &mut HashSet<(usize, usize)>) -> Option<&'a (String, T)> {
        let id = (self as *const Self as usize, at);
        if dead.contains(&id) {
            return None;
        }
        let hit = self.best_uncached(key, at, dead);
        if hit.is_none() {
            dead.insert(id);
        }
        hit
    }

    fn best_uncached<'a>(
        &'a self,
        key: &[&str],
        at: usize,
        dead: &mut HashSet<(usize, usize)>,
    ) -> Option<&'a (String, T)> {
        let Some(first) = key.get(at) else {
            if let Some(entry) = &self.entry {
                return Some(entry);
            }
            // a trailing `#` may consume nothing
            return self.hash.as_deref().and_then(|h| h.best(key, at, dead));
        };

        if let Some(hit) = self.literal.get(*first).and_then(|c| c.best(key, at + 1, dead)) {
            return Some(hit);
        }
        if let Some(hit) = self.star.as_deref().and_then(|c| c.best(key, at + 1, dead)) {
            return Some(hit);
        }
        if let Some(hash) = self.hash.as_deref() {
            for from in at..=key.len() {
                if let Some(hit) = hash.best(key, from, dead) {
                    return Some(hit);
                }
            }
        }
        None
    }

    fn collect<'a>(&'a self, out: &mut Vec<(&'a str, &'a T)>) {
        if let Some((p, v)) = &self.entry {
            out.push((p.as_str(), v));
        }
        for child in self.literal.values() {
            child.collect(out);
        }
        if let Some(star) = &self.star {
            star.collect(out);
        }
        if let Some(hash) = &self.hash {
            hash.collect(out);
        }
    }
}

/// Prefix tree of address patterns mapping to payloads.
pub struct PatternTree<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for PatternTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for PatternTree<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&str> = self.patterns().into_iter().map(|(p, _)| p).collect();
        patterns.sort_unstable();
        f.debug_struct("PatternTree").field("patterns", &patterns).finish()
    }
}

impl<T> PatternTree<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `payload` under `pattern`.
    ///
    /// If an equivalent pattern is already present the tree is left untouched
    /// and the new payload is handed back as `Err`.
    pub fn add(&mut self, pattern: &str, payload: T) -> std::result::Result<(), T> {
        let normalized = normalize(pattern);
        let mut node = &mut self.root;
        for tok in tokens(&normalized) {
            node = node.child_mut(tok);
        }
        if node.entry.is_some() {
            return Err(payload);
        }
        node.entry = Some((normalized, payload));
        self.len += 1;
        Ok(())
    }

    /// Remove the payload stored under `pattern` (matched by normalized form,
    /// not by wildcard matching).
    pub fn remove(&mut self, pattern: &str) -> Option<T> {
        let normalized = normalize(pattern);
        let path = tokens(&normalized);
        let removed = self.root.remove(&path);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Payload stored under exactly this pattern.
    pub fn get(&self, pattern: &str) -> Option<&T> {
        let normalized = normalize(pattern);
        let mut node = &self.root;
        for tok in tokens(&normalized) {
            node = node.child(tok)?;
        }
        node.entry.as_ref().map(|(_, v)| v)
    }

    /// Best-matching pattern and payload for a concrete `key`.
    pub fn retrieve(&self, key: &str) -> Option<(&str, &T)> {
        let key = tokens(key);
        self.root.best(&key, 0, &mut HashSet::new()).map(|(p, v)| (p.as_str(), v))
    }

    /// True if any stored pattern matches `key`.
    pub fn matches(&self, key: &str) -> bool {
        self.retrieve(key).is_some()
    }

    /// All stored patterns (normalized) with their payloads, in no particular
    /// order.
    pub fn patterns(&self) -> Vec<(&str, &T)> {
        let mut out = Vec::with_capacity(self.len);
        self.root.collect(&mut out);
        out
    }
}
