//! UDP transport for DNS queries.
//!
//! One receive loop reads datagrams; each datagram is handled on its own
//! task and the answer is sent back from the same socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MAX_DNS_PACKET_SIZE, Protocol, QueryHandler, is_transient};

/// UDP listener.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::from_socket(UdpSocket::bind(addr).await?))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawn the receive loop.
    ///
    /// The task only ends on a non-transient socket error; aborting the
    /// handle stops it. Queries already dispatched run to completion.
    pub fn start<H: QueryHandler>(self, handler: Arc<H>) -> JoinHandle<io::Result<()>> {
        tokio::spawn(run(self.socket, handler))
    }
}

async fn run<H: QueryHandler>(socket: Arc<UdpSocket>, handler: Arc<H>) -> io::Result<()> {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "udp recv error");
                continue;
            }
            Err(e) => return Err(e),
        };

        let request = buf[..len].to_vec();
        let socket = socket.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            let Some(response) = handler.handle(&request, src, Protocol::Udp).await else {
                return;
            };
            if let Err(e) = socket.send_to(&response, src).await {
                warn!(client = %src, error = %e, "udp response error");
            }
        });
    }
}
