//! Upstream forwarding.
//!
//! Queries that pass the filter are sent to a DNS-over-HTTPS endpoint. The
//! endpoint's own hostname is resolved through a fixed list of bootstrap
//! nameservers, never through the system resolver.

mod bootstrap;
mod doh;

pub use bootstrap::{BootstrapResolver, DEFAULT_BOOTSTRAP, DNS_PORT, normalize_bootstrap};
pub use doh::DohClient;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::time::Instant;

use crate::error::Result;

/// A single-attempt forwarding transport.
///
/// Implementations must give up once `deadline` passes. Retrying is the
/// caller's business.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward `request` and return the upstream's answer.
    async fn query(&self, deadline: Instant, request: &Message) -> Result<Message>;

    /// Identifier reported in query events and logs.
    fn endpoint(&self) -> &str;
}
