//! TCP transport for DNS queries.
//!
//! TCP DNS messages are prefixed with a 2-byte big-endian length. A
//! connection may carry several queries; it is closed after
//! [`IDLE_TIMEOUT`] without a new one.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{Protocol, QueryHandler, is_transient};

/// How long a connection may sit idle between queries.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP listener. Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    /// Wrap an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop.
    ///
    /// The task only ends on a non-transient accept error; aborting the
    /// handle stops it. Open connections are left to finish on their own.
    pub fn start<H: QueryHandler>(self, handler: Arc<H>) -> JoinHandle<io::Result<()>> {
        tokio::spawn(run_accept_loop(self.listener, handler))
    }
}

async fn run_accept_loop<H: QueryHandler>(
    listener: TcpListener,
    handler: Arc<H>,
) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, handler.clone()));
            }
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "tcp accept error");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn handle_connection<H: QueryHandler>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
) {
    loop {
        let request = match timeout(IDLE_TIMEOUT, read_dns_message(&mut stream)).await {
            Ok(Ok(Some(request))) => request,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                trace!(client = %peer, error = %e, "tcp read error");
                return;
            }
            Err(_) => {
                trace!(client = %peer, "tcp connection idle, closing");
                return;
            }
        };

        let Some(response) = handler.handle(&request, peer, Protocol::Tcp).await else {
            return;
        };

        if let Err(e) = write_dns_message(&mut stream, &response).await {
            trace!(client = %peer, error = %e, "tcp write error");
            return;
        }
    }
}

/// Read one length-prefixed DNS message, without its prefix.
///
/// Returns `None` on a clean close before a new message starts, or on a
/// zero-length message.
async fn read_dns_message(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 2];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u16::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Ok(None);
    }

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(Some(message))
}

async fn write_dns_message(stream: &mut TcpStream, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "dns message too large"))?;

    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}
