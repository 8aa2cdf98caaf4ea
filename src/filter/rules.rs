//! Allow/block rules for queried domains.
//!
//! Both lists hold domain suffixes. A rule matches a domain when the two are
//! equal or the domain ends with `.` followed by the rule, so `example.com`
//! covers `www.example.com` but not `notexample.com`.

use rustc_hash::FxHashSet;

use super::normalize;

/// Immutable allow/block rule set.
///
/// The declared lists are kept in order for display; lookups go through
/// hashed indexes built once at construction.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    blocklist: Vec<String>,
    allowlist: Vec<String>,
    blocked: FxHashSet<String>,
    allowed: FxHashSet<String>,
}

impl RuleSet {
    /// Build a rule set from the configured block and allow lists.
    pub fn new(blocklist: Vec<String>, allowlist: Vec<String>) -> Self {
        let blocked = index(&blocklist);
        let allowed = index(&allowlist);

        Self {
            blocklist,
            allowlist,
            blocked,
            allowed,
        }
    }

    /// Check if a domain should be blocked.
    ///
    /// Allowlist entries win over any blocklist entry covering the same
    /// domain, whatever order the lists were declared in.
    pub fn should_block(&self, domain: &str) -> bool {
        let domain = normalize(domain);

        if matches_any(&self.allowed, &domain) {
            return false;
        }
        matches_any(&self.blocked, &domain)
    }

    pub fn blocklist(&self) -> &[String] {
        &self.blocklist
    }

    pub fn allowlist(&self) -> &[String] {
        &self.allowlist
    }

    /// Returns the number of distinct blocked suffixes.
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}

fn index(rules: &[String]) -> FxHashSet<String> {
    rules
        .iter()
        .map(|rule| normalize(rule))
        .filter(|rule| !rule.is_empty())
        .collect()
}

/// Walk the label suffixes of `domain`, checking each against `rules`.
fn matches_any(rules: &FxHashSet<String>, domain: &str) -> bool {
    if rules.is_empty() {
        return false;
    }

    let mut current = domain;
    loop {
        if rules.contains(current) {
            return true;
        }
        match current.find('.') {
            Some(pos) => current = &current[pos + 1..],
            None => return false,
        }
    }
}
