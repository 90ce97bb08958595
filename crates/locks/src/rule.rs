//! Scheduling rules.
//!
//! A rule describes a unit of exclusion: two jobs whose rules conflict must
//! never run at the same time. Rules also form a containment hierarchy which
//! validates nested `begin_rule` calls.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a rule. Rule identity (for nesting checks and the
/// wait-for graph) is the `Arc` allocation, so callers should reuse one
/// handle per logical rule rather than rebuilding equal rules.
pub type RuleRef = Arc<dyn Rule>;

/// A scheduling rule. Implementations must keep `is_conflicting` reflexive
/// and symmetric, and `contains` reflexive and transitive.
pub trait Rule: Send + Sync {
    /// True when this rule and `other` must not be active concurrently.
    fn is_conflicting(&self, other: &dyn Rule) -> bool;

    /// True when this rule is broad enough that `other` may nest inside it.
    fn contains(&self, other: &dyn Rule) -> bool;

    /// Child rules of a composite. Atomic rules return an empty slice.
    fn children(&self) -> &[RuleRef] {
        &[]
    }

    /// Escape hatch for rules that need to recognize their own kind.
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rule({:p})", self as *const dyn Rule)
    }
}

/// A composite rule conflicting with anything one of its children conflicts
/// with, and containing only what its children jointly contain.
pub struct MultiRule {
    children: Vec<RuleRef>,
}

impl MultiRule {
    /// Combines two optional rules. `None` acts as the identity, and when
    /// one rule already contains the other the broader rule is returned
    /// alone; only genuinely disjoint rules produce a composite.
    pub fn combine(first: Option<RuleRef>, second: Option<RuleRef>) -> Option<RuleRef> {
        match (first, second) {
            (None, None) => None,
            (Some(r), None) | (None, Some(r)) => Some(r),
            (Some(a), Some(b)) => {
                if Arc::ptr_eq(&a, &b) || a.contains(b.as_ref()) {
                    return Some(a);
                }
                if b.contains(a.as_ref()) {
                    return Some(b);
                }
                let mut children = Vec::new();
                Self::flatten_into(a, &mut children);
                Self::flatten_into(b, &mut children);
                Some(Arc::new(MultiRule { children }))
            }
        }
    }

    fn flatten_into(rule: RuleRef, out: &mut Vec<RuleRef>) {
        if rule.children().is_empty() {
            out.push(rule);
        } else {
            out.extend(rule.children().iter().cloned());
        }
    }
}

impl Rule for MultiRule {
    fn is_conflicting(&self, other: &dyn Rule) -> bool {
        let theirs = other.children();
        if theirs.is_empty() {
            return self.children.iter().any(|c| c.is_conflicting(other));
        }
        self.children
            .iter()
            .any(|mine| theirs.iter().any(|t| mine.is_conflicting(t.as_ref())))
    }

    fn contains(&self, other: &dyn Rule) -> bool {
        let theirs = other.children();
        if theirs.is_empty() {
            return self.children.iter().any(|c| c.contains(other));
        }
        // Every piece of the other composite must fit under one of ours.
        theirs
            .iter()
            .all(|t| self.children.iter().any(|mine| mine.contains(t.as_ref())))
    }

    fn children(&self) -> &[RuleRef] {
        &self.children
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A rule over a slash-separated path. Rules conflict when one path is a
/// prefix of the other, and a rule contains every rule beneath its path.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PathRule {
    path: String,
}

impl PathRule {
    pub fn new(path: impl Into<String>) -> Self {
        PathRule { path: path.into() }
    }

    /// Convenience constructor producing a shared handle.
    pub fn shared(path: impl Into<String>) -> RuleRef {
        Arc::new(PathRule::new(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn is_prefix_of(&self, other: &PathRule) -> bool {
        let rest = match other.path.strip_prefix(&self.path) {
            Some(rest) => rest,
            None => return false,
        };
        rest.is_empty() || rest.starts_with('/') || self.path.ends_with('/')
    }
}

impl Rule for PathRule {
    fn is_conflicting(&self, other: &dyn Rule) -> bool {
        if !other.children().is_empty() {
            return other.is_conflicting(self);
        }
        match other.as_any().downcast_ref::<PathRule>() {
            Some(o) => self.is_prefix_of(o) || o.is_prefix_of(self),
            None => false,
        }
    }

    fn contains(&self, other: &dyn Rule) -> bool {
        let theirs = other.children();
        if !theirs.is_empty() {
            return theirs.iter().all(|t| self.contains(t.as_ref()));
        }
        match other.as_any().downcast_ref::<PathRule>() {
            Some(o) => self.is_prefix_of(o),
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
