//! DNS query filtering.
//!
//! Decides whether a queried domain is answered locally with NXDOMAIN or
//! forwarded upstream, based on the configured allow and block lists.

mod rules;

pub use rules::RuleSet;

/// Lowercase a domain and strip a single trailing dot.
pub fn normalize(domain: &str) -> String {
    let domain = domain.trim();
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    domain.to_ascii_lowercase()
}
