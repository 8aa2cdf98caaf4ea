//! DNS query resolution logic.
//!
//! A [`Snapshot`] bundles the configuration with the rules and upstream
//! derived from it. One snapshot is captured per query, so a reload never
//! changes the rules or upstream a query is halfway through.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use tokio::time::Instant;

use crate::config::Config;
use crate::dns::{answer_ips, question_name, reply};
use crate::events::QueryEvent;
use crate::filter::RuleSet;
use crate::retry::query_with_retry;
use crate::upstream::Upstream;

/// Action to take for a DNS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    /// Answer NXDOMAIN without touching the network.
    Blocked,
    Forward,
}

/// Immutable configuration, rules and upstream used for one query.
pub struct Snapshot {
    config: Config,
    rules: RuleSet,
    upstream: Arc<dyn Upstream>,
}

impl Snapshot {
    pub fn new(config: Config, upstream: Arc<dyn Upstream>) -> Self {
        let rules = config.rule_set();
        Self {
            config,
            rules,
            upstream,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub fn process_query(&self, domain: &str) -> QueryAction {
        if self.rules.should_block(domain) {
            QueryAction::Blocked
        } else {
            QueryAction::Forward
        }
    }

    /// Run the pipeline for a request that carries a question.
    ///
    /// Never fails: upstream errors become SERVFAIL and are reported in the
    /// returned event.
    pub async fn resolve(&self, request: &Message, client: IpAddr) -> (Message, QueryEvent) {
        let start = Instant::now();
        let mut event = QueryEvent {
            domain: question_name(request).unwrap_or_default(),
            client,
            upstream: self.upstream.endpoint().to_string(),
            response_ips: Vec::new(),
            rcode: ResponseCode::NoError,
            duration: Duration::ZERO,
            blocked: false,
            error: None,
        };

        if self.process_query(&event.domain) == QueryAction::Blocked {
            event.blocked = true;
            event.rcode = ResponseCode::NXDomain;
            event.duration = start.elapsed();
            return (reply(request, ResponseCode::NXDomain), event);
        }

        let upstream = &self.config.upstream;
        let deadline = start + upstream.timeout;
        let result = query_with_retry(deadline, upstream.retries, upstream.retry_delay, || {
            self.upstream.query(deadline, request)
        })
        .await;
        event.duration = start.elapsed();

        let response = match result {
            Ok(mut response) => {
                response.set_id(request.id());
                event.response_ips = answer_ips(&response);
                response
            }
            Err(err) => {
                event.error = Some(err.to_string());
                reply(request, ResponseCode::ServFail)
            }
        };
        event.rcode = response.response_code();

        (response, event)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("config", &self.config)
            .field("blocked", &self.rules.blocked_count())
            .field("upstream", &self.upstream.endpoint())
            .finish()
    }
}
