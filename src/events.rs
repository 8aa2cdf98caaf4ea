//! Per-query events and their fan-out to stats, logs and an observer.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::ResponseCode;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, trace};

use crate::stats::{Stats, StatsSnapshot};

/// Outcome of one completed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    /// Queried name as it appeared in the question.
    pub domain: String,
    pub client: IpAddr,
    /// Endpoint the query was (or would have been) forwarded to.
    pub upstream: String,
    pub response_ips: Vec<IpAddr>,
    pub rcode: ResponseCode,
    pub duration: Duration,
    pub blocked: bool,
    pub error: Option<String>,
}

/// Records every completed query.
///
/// Stats are always updated and the outcome is always logged. The optional
/// observer gets a best-effort copy: when its channel is full or closed the
/// event is dropped instead of stalling resolution.
#[derive(Debug, Clone)]
pub struct EventSink {
    stats: Arc<Stats>,
    observer: Option<mpsc::Sender<QueryEvent>>,
}

impl EventSink {
    pub fn new(observer: Option<mpsc::Sender<QueryEvent>>) -> Self {
        Self {
            stats: Arc::new(Stats::new()),
            observer,
        }
    }

    pub fn record(&self, event: QueryEvent) {
        self.stats.record(&event);
        log_outcome(&event);

        let Some(observer) = &self.observer else {
            return;
        };
        match observer.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                trace!(domain = %event.domain, "observer busy, event dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn log_outcome(event: &QueryEvent) {
    if event.blocked {
        info!(domain = %event.domain, client = %event.client, "blocked");
    } else if let Some(err) = &event.error {
        error!(
            domain = %event.domain,
            client = %event.client,
            upstream = %event.upstream,
            elapsed_ms = event.duration.as_millis() as u64,
            "error handling query: {err}"
        );
    } else {
        debug!(
            domain = %event.domain,
            upstream = %event.upstream,
            ips = ?event.response_ips,
            rcode = %event.rcode,
            elapsed_ms = event.duration.as_millis() as u64,
            "resolved"
        );
    }
}
