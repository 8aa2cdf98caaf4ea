//! DNS-over-HTTPS client (RFC 8484, POST with `application/dns-message`).

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::time::{Instant, timeout_at};
use tracing::trace;

use super::Upstream;
use super::bootstrap::BootstrapResolver;
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::retry::DeadlineExceeded;

const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// Bytes of a non-200 body kept in the error.
const ERROR_BODY_LIMIT: usize = 256;

/// Single-attempt DoH transport.
///
/// Connections are pooled by the inner `reqwest::Client`; the endpoint's
/// hostname is resolved through [`BootstrapResolver`].
pub struct DohClient {
    endpoint: String,
    url: Url,
    client: reqwest::Client,
    bootstrap: Vec<String>,
    timeout: Duration,
}

impl std::fmt::Debug for DohClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohClient")
            .field("endpoint", &self.endpoint)
            .field("bootstrap", &self.bootstrap)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DohClient {
    /// Create a client for `endpoint`.
    ///
    /// `bootstrap` is normalized first, so an empty list selects the default
    /// public resolvers.
    pub fn new(endpoint: &str, timeout: Duration, bootstrap: &[String]) -> Result<Self> {
        let url = Url::parse(endpoint.trim())
            .map_err(|e| Error::config("upstream.doh_endpoint", format!("{endpoint}: {e}")))?;
        if !matches!(url.scheme(), "https" | "http") || url.host_str().is_none() {
            return Err(Error::config(
                "upstream.doh_endpoint",
                format!("{endpoint} is not an http(s) URL"),
            ));
        }

        let resolver = BootstrapResolver::new(bootstrap, timeout)?;
        let bootstrap = resolver.servers().iter().map(|s| s.to_string()).collect();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .dns_resolver(Arc::new(resolver))
            .no_proxy()
            .user_agent(concat!("dnsbro/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim().to_string(),
            url,
            client,
            bootstrap,
            timeout,
        })
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        Self::new(&config.doh_endpoint, config.timeout, &config.bootstrap)
    }

    /// Bootstrap servers in the order they are tried.
    pub fn bootstrap(&self) -> &[String] {
        &self.bootstrap
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn exchange(&self, request: &Message) -> Result<Message> {
        let wire = request.to_vec().map_err(Error::Serialize)?;

        let mut response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(ACCEPT, DOH_CONTENT_TYPE)
            .body(wire)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            let mut excerpt = Vec::with_capacity(ERROR_BODY_LIMIT);
            while excerpt.len() < ERROR_BODY_LIMIT {
                let Ok(Some(chunk)) = response.chunk().await else {
                    break;
                };
                let take = chunk.len().min(ERROR_BODY_LIMIT - excerpt.len());
                excerpt.extend_from_slice(&chunk[..take]);
            }
            return Err(Error::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&excerpt).into_owned(),
            });
        }

        let body = response.bytes().await?;
        trace!(endpoint = %self.endpoint, len = body.len(), "doh response received");

        Message::from_vec(&body).map_err(Error::Parse)
    }
}

#[async_trait]
impl Upstream for DohClient {
    async fn query(&self, deadline: Instant, request: &Message) -> Result<Message> {
        timeout_at(deadline, self.exchange(request))
            .await
            .map_err(|_| DeadlineExceeded)?
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Surface bootstrap exhaustion buried in a connect error.
fn classify_send_error(err: reqwest::Error) -> Error {
    let mut cause: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(current) = cause {
        if is_bootstrap_exhausted(current) {
            return Error::NoBootstrapServer;
        }
        cause = current.source();
    }
    Error::Http(err)
}

fn is_bootstrap_exhausted(err: &(dyn StdError + 'static)) -> bool {
    if let Some(Error::NoBootstrapServer) = err.downcast_ref::<Error>() {
        return true;
    }
    err.downcast_ref::<io::Error>()
        .and_then(|io| io.get_ref())
        .and_then(|inner| inner.downcast_ref::<Error>())
        .is_some_and(|inner| matches!(inner, Error::NoBootstrapServer))
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::str::FromStr;

    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::upstream::bootstrap::tests::{dead_server, spawn_nameserver};

    #[derive(Clone, Copy)]
    enum Behavior {
        Answer,
        Status(u16),
        /// Error status whose body never finishes.
        EndlessStatus(u16),
        Garbage,
        Stall,
    }

    fn create_query(domain: &str, id: u16) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        message
    }

    fn answer_for(request: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NoError);
        response.add_queries(request.queries().iter().cloned());
        let name = request.queries()[0].name().clone();
        response.add_answer(Record::from_rdata(
            name,
            300,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        response
    }

    /// Minimal HTTP/1.1 server standing in for a DoH endpoint.
    async fn spawn_endpoint(behavior: Behavior) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let body = read_request_body(&mut stream).await;
                    let (status, payload) = match behavior {
                        Behavior::Answer => {
                            let request = Message::from_vec(&body).unwrap();
                            (200, answer_for(&request).to_vec().unwrap())
                        }
                        Behavior::Status(code) => (code, vec![b'x'; 1024]),
                        Behavior::EndlessStatus(code) => {
                            let head = format!(
                                "HTTP/1.1 {code} Status\r\ncontent-type: text/plain\r\n\
                                 content-length: 1073741824\r\n\r\n"
                            );
                            let _ = stream.write_all(head.as_bytes()).await;
                            let _ = stream.write_all(&[b'y'; 4096]).await;
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            return;
                        }
                        Behavior::Garbage => (200, b"not dns".to_vec()),
                        Behavior::Stall => {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            return;
                        }
                    };
                    let head = format!(
                        "HTTP/1.1 {status} Status\r\ncontent-type: {DOH_CONTENT_TYPE}\r\n\
                         content-length: {}\r\nconnection: close\r\n\r\n",
                        payload.len()
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(&payload).await;
                });
            }
        });

        addr
    }

    async fn read_request_body(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return Vec::new();
            }
            data.extend_from_slice(&buf[..n]);

            let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + length {
                return data[end + 4..end + 4 + length].to_vec();
            }
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn rejects_unparseable_endpoint() {
        let err = DohClient::new("dns server/dns-query", Duration::from_secs(1), &[]).unwrap_err();

        assert!(matches!(err, Error::Config { field: "upstream.doh_endpoint", .. }));
    }

    #[test]
    fn rejects_non_http_scheme() {
        let err =
            DohClient::new("ftp://1.1.1.1/dns-query", Duration::from_secs(1), &[]).unwrap_err();

        assert!(err.to_string().contains("not an http(s) URL"));
    }

    #[test]
    fn empty_bootstrap_uses_defaults() {
        let client =
            DohClient::new("https://dns.example/dns-query", Duration::from_secs(1), &[]).unwrap();

        assert_eq!(client.bootstrap(), ["1.1.1.1:53", "8.8.8.8:53"]);
        assert_eq!(client.endpoint(), "https://dns.example/dns-query");
    }

    #[test]
    fn debug_shows_endpoint() {
        let client =
            DohClient::new("https://dns.example/dns-query", Duration::from_secs(2), &[]).unwrap();

        let debug = format!("{client:?}");
        assert!(debug.contains("DohClient"));
        assert!(debug.contains("dns.example"));
    }

    #[tokio::test]
    async fn query_round_trips_through_endpoint() {
        let addr = spawn_endpoint(Behavior::Answer).await;
        let client = DohClient::new(
            &format!("http://{addr}/dns-query"),
            Duration::from_secs(2),
            &[],
        )
        .unwrap();

        let request = create_query("example.com.", 0x1234);
        let response = client.query(deadline(), &request).await.unwrap();

        assert_eq!(response.id(), 0x1234);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn endpoint_host_resolves_through_bootstrap() {
        let endpoint = spawn_endpoint(Behavior::Answer).await;
        let nameserver = spawn_nameserver(Ipv4Addr::LOCALHOST).await;
        let client = DohClient::new(
            &format!("http://doh.test:{}/dns-query", endpoint.port()),
            Duration::from_secs(2),
            &[nameserver.to_string()],
        )
        .unwrap();

        let response = client.query(deadline(), &create_query("example.com.", 7)).await.unwrap();

        assert_eq!(response.id(), 7);
    }

    #[tokio::test]
    async fn unreachable_bootstrap_is_reported() {
        let client = DohClient::new(
            "http://doh.test:8053/dns-query",
            Duration::from_millis(300),
            &[dead_server().await.to_string()],
        )
        .unwrap();

        let err = client.query(deadline(), &create_query("example.com.", 1)).await.unwrap_err();

        assert!(matches!(err, Error::NoBootstrapServer), "got {err}");
    }

    #[tokio::test]
    async fn non_200_status_carries_truncated_body() {
        let addr = spawn_endpoint(Behavior::Status(502)).await;
        let client =
            DohClient::new(&format!("http://{addr}/dns-query"), Duration::from_secs(2), &[])
                .unwrap();

        let err = client.query(deadline(), &create_query("example.com.", 1)).await.unwrap_err();

        match err {
            Error::Status { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), ERROR_BODY_LIMIT);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn error_body_read_stops_at_limit() {
        let addr = spawn_endpoint(Behavior::EndlessStatus(503)).await;
        let client =
            DohClient::new(&format!("http://{addr}/dns-query"), Duration::from_secs(30), &[])
                .unwrap();
        let start = std::time::Instant::now();

        let err = client.query(deadline(), &create_query("example.com.", 1)).await.unwrap_err();

        match err {
            Error::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "y".repeat(ERROR_BODY_LIMIT));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn undecodable_body_is_an_error() {
        let addr = spawn_endpoint(Behavior::Garbage).await;
        let client =
            DohClient::new(&format!("http://{addr}/dns-query"), Duration::from_secs(2), &[])
                .unwrap();

        let err = client.query(deadline(), &create_query("example.com.", 1)).await.unwrap_err();

        assert!(matches!(err, Error::Parse(_)), "got {err}");
    }

    #[tokio::test]
    async fn deadline_bounds_the_exchange() {
        let addr = spawn_endpoint(Behavior::Stall).await;
        let client =
            DohClient::new(&format!("http://{addr}/dns-query"), Duration::from_secs(30), &[])
                .unwrap();
        let start = std::time::Instant::now();

        let err = client
            .query(
                Instant::now() + Duration::from_millis(50),
                &create_query("example.com.", 1),
            )
            .await
            .unwrap_err();

        assert!(err.is_deadline(), "got {err}");
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
