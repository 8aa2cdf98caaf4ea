//! Query counters shared by every transport.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::events::QueryEvent;

#[derive(Debug, Default)]
struct Counters {
    queries: u64,
    blocked: u64,
    failures: u64,
    forwarded: u64,
    /// Cumulative upstream time of forwarded queries.
    upstream_time: Duration,
    last: Option<QueryEvent>,
}

/// Running totals, updated once per completed query.
///
/// All fields live behind one lock so a reader never sees a partially
/// applied event.
#[derive(Debug, Default)]
pub struct Stats {
    inner: Mutex<Counters>,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub blocked: u64,
    pub failures: u64,
    /// Mean upstream latency of forwarded queries, in milliseconds.
    pub avg_response_ms: f64,
    pub last: Option<QueryEvent>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &QueryEvent) {
        let mut counters = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        counters.queries += 1;
        if event.blocked {
            counters.blocked += 1;
        }
        if event.error.is_some() {
            counters.failures += 1;
        }
        if !event.blocked {
            counters.forwarded += 1;
            counters.upstream_time += event.duration;
        }
        counters.last = Some(event.clone());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let avg_response_ms = if counters.forwarded > 0 {
            counters.upstream_time.as_secs_f64() * 1000.0 / counters.forwarded as f64
        } else {
            0.0
        };

        StatsSnapshot {
            queries: counters.queries,
            blocked: counters.blocked,
            failures: counters.failures,
            avg_response_ms,
            last: counters.last.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use hickory_proto::op::ResponseCode;

    use super::*;

    fn event(domain: &str, blocked: bool, error: Option<&str>, millis: u64) -> QueryEvent {
        QueryEvent {
            domain: domain.to_string(),
            client: IpAddr::V4(Ipv4Addr::LOCALHOST),
            upstream: "https://dns.example/dns-query".to_string(),
            response_ips: Vec::new(),
            rcode: ResponseCode::NoError,
            duration: Duration::from_millis(millis),
            blocked,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn counts_each_outcome() {
        let stats = Stats::new();

        stats.record(&event("ads.test.", true, None, 0));
        stats.record(&event("example.com.", false, None, 10));
        stats.record(&event("broken.test.", false, Some("doh status 502: bad"), 30));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queries, 3);
        assert_eq!(snapshot.blocked, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.last.unwrap().domain, "broken.test.");
    }

    #[test]
    fn average_ignores_blocked_queries() {
        let stats = Stats::new();

        stats.record(&event("a.test.", false, None, 10));
        stats.record(&event("b.test.", false, None, 30));
        stats.record(&event("ads.test.", true, None, 0));

        assert!((stats.snapshot().avg_response_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn empty_stats() {
        let snapshot = Stats::new().snapshot();

        assert_eq!(snapshot.queries, 0);
        assert_eq!(snapshot.avg_response_ms, 0.0);
        assert!(snapshot.last.is_none());
    }
}
