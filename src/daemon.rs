//! Daemon orchestration.
//!
//! Binds both transports, dispatches queries through the current
//! [`Snapshot`] and swaps that snapshot on reload.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::{Config, UpstreamConfig};
use crate::dns::{encode_with_limit, format_error, reply, udp_payload_limit};
use crate::error::{Error, Result};
use crate::events::{EventSink, QueryEvent};
use crate::resolver::Snapshot;
use crate::stats::StatsSnapshot;
use crate::transport::tcp::TcpTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{Protocol, QueryHandler};
use crate::upstream::{DohClient, Upstream};

/// Builds the upstream for a configuration.
pub type Connector = Arc<dyn Fn(&UpstreamConfig) -> Result<Arc<dyn Upstream>> + Send + Sync>;

/// The resolution daemon.
///
/// Owns the active snapshot and the event sink. Share it behind an `Arc`:
/// transports hold a reference while serving and reloads go through
/// [`Daemon::reload`].
pub struct Daemon {
    current: RwLock<Arc<Snapshot>>,
    events: EventSink,
    connect: Connector,
}

impl Daemon {
    /// Create a daemon forwarding over DNS-over-HTTPS.
    pub fn new(config: Config, observer: Option<mpsc::Sender<QueryEvent>>) -> Result<Self> {
        Self::with_connector(
            config,
            observer,
            Arc::new(|upstream: &UpstreamConfig| {
                Ok(Arc::new(DohClient::from_config(upstream)?) as Arc<dyn Upstream>)
            }),
        )
    }

    /// Create a daemon whose upstreams come from `connect`.
    pub fn with_connector(
        config: Config,
        observer: Option<mpsc::Sender<QueryEvent>>,
        connect: Connector,
    ) -> Result<Self> {
        let snapshot = build_snapshot(&connect, config)?;

        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            events: EventSink::new(observer),
            connect,
        })
    }

    /// The snapshot new queries are served with.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the active configuration.
    ///
    /// The new rules and upstream are built before the swap; on failure the
    /// running snapshot stays in place. Queries already in flight finish with
    /// the snapshot they started with.
    pub fn reload(&self, config: Config) -> Result<()> {
        let next = build_snapshot(&self.connect, config).inspect_err(|e| {
            error!(error = %e, "reload failed, keeping current configuration");
        })?;

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.config().listen != next.config().listen {
            warn!(
                running = %current.config().listen,
                configured = %next.config().listen,
                "listen address changed, restart to rebind"
            );
        }
        info!(
            upstream = next.upstream().endpoint(),
            blocked = next.rules().blocked_count(),
            allowed = next.rules().allowlist().len(),
            "configuration reloaded"
        );
        *current = Arc::new(next);

        Ok(())
    }

    /// Counters and the last event since startup.
    pub fn stats(&self) -> StatsSnapshot {
        self.events.stats()
    }

    /// Bind the configured address on UDP and TCP and serve until
    /// `shutdown` completes.
    ///
    /// Returns [`Error::Cancelled`] after a requested shutdown, or the first
    /// listener error.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.snapshot().config().listen;

        let udp = UdpTransport::bind(addr)
            .await
            .map_err(|source| Error::Listener {
                protocol: Protocol::Udp.as_str(),
                source,
            })?;
        let tcp = TcpTransport::bind(addr)
            .await
            .map_err(|source| Error::Listener {
                protocol: Protocol::Tcp.as_str(),
                source,
            })?;

        let snapshot = self.snapshot();
        info!(
            listen = %addr,
            upstream = snapshot.upstream().endpoint(),
            blocked = snapshot.rules().blocked_count(),
            "dns daemon listening"
        );

        self.serve(udp, tcp, shutdown).await
    }

    /// Serve on already bound transports.
    pub async fn serve<F>(
        self: Arc<Self>,
        udp: UdpTransport,
        tcp: TcpTransport,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut udp = AbortOnDrop(udp.start(self.clone()));
        let mut tcp = AbortOnDrop(tcp.start(self));

        tokio::select! {
            result = &mut udp.0 => Err(listener_exit(Protocol::Udp, result)),
            result = &mut tcp.0 => Err(listener_exit(Protocol::Tcp, result)),
            () = shutdown => {
                info!("shutting down");
                Err(Error::Cancelled)
            }
        }
    }
}

#[async_trait]
impl QueryHandler for Daemon {
    async fn handle(
        &self,
        raw: &[u8],
        client: SocketAddr,
        protocol: Protocol,
    ) -> Option<Vec<u8>> {
        let request = match Message::from_vec(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!(%client, %protocol, error = %e, "malformed query");
                return format_error(raw);
            }
        };

        if request.queries().is_empty() {
            debug!(%client, %protocol, id = request.id(), "query without question");
            return reply(&request, ResponseCode::FormErr).to_vec().ok();
        }

        let snapshot = self.snapshot();
        let (response, event) = snapshot.resolve(&request, client.ip()).await;
        self.events.record(event);

        let limit = match protocol {
            Protocol::Udp => udp_payload_limit(&request),
            Protocol::Tcp => usize::from(u16::MAX),
        };
        match encode_with_limit(&response, limit) {
            Ok(wire) => Some(wire),
            Err(e) => {
                error!(%client, error = %e, "failed to encode response");
                reply(&request, ResponseCode::ServFail).to_vec().ok()
            }
        }
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("snapshot", &self.snapshot())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn build_snapshot(connect: &Connector, config: Config) -> Result<Snapshot> {
    config.validate()?;
    let upstream = connect(&config.upstream)?;
    Ok(Snapshot::new(config, upstream))
}

fn listener_exit(
    protocol: Protocol,
    result: std::result::Result<io::Result<()>, JoinError>,
) -> Error {
    let source = match result {
        Ok(Err(e)) => e,
        Ok(Ok(())) => io::Error::other("listener stopped"),
        Err(e) => io::Error::other(e),
    };
    Error::Listener {
        protocol: protocol.as_str(),
        source,
    }
}

/// Stops a listener task when the serving future goes away.
struct AbortOnDrop(JoinHandle<io::Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
