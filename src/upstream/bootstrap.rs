//! Bootstrap name resolution for the DoH endpoint.
//!
//! The daemon usually replaces the host's resolver, so the endpoint hostname
//! cannot be looked up through it. Instead the configured bootstrap servers
//! are asked directly over UDP, in order; the first one that answers is used.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use reqwest::dns::{Addrs, Resolve, Resolving};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Standard DNS port appended to bootstrap entries that lack one.
pub const DNS_PORT: u16 = 53;

/// Bootstrap servers used when none are configured.
pub const DEFAULT_BOOTSTRAP: [&str; 2] = ["1.1.1.1:53", "8.8.8.8:53"];

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Upper bound for a single bootstrap server exchange.
const MAX_SERVER_TIMEOUT: Duration = Duration::from_secs(2);

/// Append the DNS port to entries without one.
///
/// An empty list (or one holding only blank entries) becomes
/// [`DEFAULT_BOOTSTRAP`].
pub fn normalize_bootstrap(servers: &[String]) -> Vec<String> {
    let normalized: Vec<String> = servers
        .iter()
        .map(|server| server.trim())
        .filter(|server| !server.is_empty())
        .map(with_default_port)
        .collect();

    if normalized.is_empty() {
        return DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect();
    }
    normalized
}

fn with_default_port(server: &str) -> String {
    if server.parse::<SocketAddr>().is_ok() {
        return server.to_string();
    }

    let bare = server.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return SocketAddr::new(ip, DNS_PORT).to_string();
    }

    match server.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => server.to_string(),
        _ => format!("{server}:{DNS_PORT}"),
    }
}

/// Resolves hostnames through an explicit list of nameservers.
#[derive(Debug, Clone)]
pub struct BootstrapResolver {
    servers: Arc<[SocketAddr]>,
    timeout: Duration,
}

impl BootstrapResolver {
    /// Build a resolver from normalized `ip:port` entries.
    pub fn new(servers: &[String], timeout: Duration) -> Result<Self> {
        let servers = normalize_bootstrap(servers)
            .iter()
            .map(|server| {
                server.parse::<SocketAddr>().map_err(|_| {
                    Error::config(
                        "upstream.bootstrap",
                        format!("{server} is not an ip:port address"),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            servers: servers.into(),
            timeout: timeout.min(MAX_SERVER_TIMEOUT),
        })
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Look up the A and AAAA addresses of `host`.
    ///
    /// Servers are tried in order. A server that fails to answer is skipped;
    /// the first answer is final, even when it holds no addresses.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let name = Name::from_ascii(host).map_err(Error::Parse)?;

        for server in self.servers.iter() {
            match self.lookup_with(*server, &name).await {
                Ok(addrs) if addrs.is_empty() => {
                    return Err(Error::Bootstrap {
                        host: host.to_string(),
                        reason: format!("{server} returned no addresses"),
                    });
                }
                Ok(addrs) => {
                    debug!(host, %server, ?addrs, "bootstrap lookup succeeded");
                    return Ok(addrs);
                }
                Err(e) => {
                    warn!(host, %server, error = %e, "bootstrap server unavailable");
                }
            }
        }

        Err(Error::NoBootstrapServer)
    }

    async fn lookup_with(&self, server: SocketAddr, name: &Name) -> Result<Vec<IpAddr>> {
        let (v4, v6) = futures::future::join(
            self.exchange(server, name, RecordType::A),
            self.exchange(server, name, RecordType::AAAA),
        )
        .await;

        match (v4, v6) {
            (Err(e), Err(_)) => Err(e),
            (v4, v6) => Ok(v4
                .unwrap_or_default()
                .into_iter()
                .chain(v6.unwrap_or_default())
                .collect()),
        }
    }

    async fn exchange(
        &self,
        server: SocketAddr,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        let id: u16 = rand::random();
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        request.add_query(Query::query(name.clone(), record_type));
        let wire = request.to_vec().map_err(Error::Serialize)?;

        let response = timeout(self.timeout, async {
            socket.send(&wire).await?;
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            loop {
                let len = socket.recv(&mut buf).await?;
                match Message::from_vec(&buf[..len]) {
                    Ok(response) if response.id() == id => return Ok::<_, Error>(response),
                    _ => continue,
                }
            }
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "bootstrap server timed out"))??;

        match response.response_code() {
            ResponseCode::NoError | ResponseCode::NXDomain => {}
            code => {
                return Err(Error::Bootstrap {
                    host: name.to_string(),
                    reason: format!("{server} answered {code}"),
                });
            }
        }

        Ok(response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect())
    }
}

impl Resolve for BootstrapResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> Resolving {
        let resolver = self.clone();
        let host = name.as_str().to_string();

        Box::pin(async move {
            let addrs = resolver.lookup(&host).await?;
            Ok::<Addrs, BoxError>(Box::new(
                addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)),
            ))
        })
    }
}
