//! Error types for the daemon.

use std::io;

use hickory_proto::error::ProtoError;
use thiserror::Error;

use crate::retry::DeadlineExceeded;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the daemon and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected during validation.
    #[error("invalid configuration ({field}): {reason}")]
    Config { field: &'static str, reason: String },

    #[error("parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("pack dns msg: {0}")]
    Serialize(#[source] ProtoError),

    #[error("unpack dns msg: {0}")]
    Parse(#[source] ProtoError),

    #[error("perform doh request: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with something other than 200 OK.
    #[error("doh status {status}: {body}")]
    Status { status: u16, body: String },

    /// Every bootstrap server refused or timed out.
    #[error("no bootstrap server available")]
    NoBootstrapServer,

    #[error("bootstrap lookup for {host} failed: {reason}")]
    Bootstrap { host: String, reason: String },

    #[error(transparent)]
    DeadlineExceeded(#[from] DeadlineExceeded),

    /// The daemon was asked to shut down.
    #[error("daemon cancelled")]
    Cancelled,

    #[error("{protocol} listener failed: {source}")]
    Listener {
        protocol: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }

    /// True when the error only signals a requested shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the error came from the per-query deadline.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}
