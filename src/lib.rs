//! dnsbro - a local DNS daemon with allow/block rules and DNS-over-HTTPS
//! forwarding.
//!
//! The library exposes the daemon and its parts for the binary, tests and
//! benchmarks.

pub mod config;
pub mod daemon;
pub mod dns;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod resolver;
pub mod retry;
pub mod stats;
pub mod transport;
pub mod upstream;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use events::QueryEvent;
pub use filter::RuleSet;
