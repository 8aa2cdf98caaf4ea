//! Transport layer: UDP and TCP listeners.
//!
//! Transports only move bytes. Every complete request is handed to a
//! [`QueryHandler`] on its own task and whatever it returns is written back
//! to the client.

pub mod tcp;
pub mod udp;

use std::fmt;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns one raw request into one raw response.
#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    /// Handle a request received from `client`.
    ///
    /// `None` means the request is silently dropped.
    async fn handle(&self, request: &[u8], client: SocketAddr, protocol: Protocol)
    -> Option<Vec<u8>>;
}

/// Errors an accept or receive loop can ride out.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
