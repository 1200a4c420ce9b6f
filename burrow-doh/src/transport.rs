//! POST-only DNS-over-HTTPS client.
//!
//! The transport owns the address set for its server and dials through the
//! retrying splitter, so even the DoH connection itself survives SNI-based
//! interference. HTTP/2 is preferred through ALPN and one connection is kept
//! pooled; servers that negotiate HTTP/1.1 get one-shot requests instead.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

use burrow_net::dialer::Dialer;
use burrow_net::retry::{dial_with_split_retry, Retrier};

use crate::error::{DohError, QueryStatus, Result};
use crate::ipmap::{IpMap, IpSet};
use crate::padding::add_edns_padding;

const MIME_TYPE: &str = "application/dns-message";
const USER_AGENT: &str = "Intra";

/// Wait up to three seconds for the TCP handshake to complete.
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Summary of a DNS transaction, reported when it completes.
#[derive(Clone, Debug, Default)]
pub struct Summary {
    /// Response (or failure) latency in seconds.
    pub latency: f64,
    pub query: Vec<u8>,
    pub response: Vec<u8>,
    /// IP address of the server, empty if it could not be determined.
    pub server: String,
    /// A [`QueryStatus`] code.
    pub status: i32,
}

/// Receives a [`Summary`] once per query.
pub trait DohListener: Send + Sync {
    fn on_transaction(&self, summary: &Summary);
}

/// A DNS query transport. Exported at the embedder boundary, so it stays
/// minimal.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Given a DNS query (including ID), returns a DNS response with
    /// matching ID, or an error if no response was received.
    async fn query(&self, q: &[u8]) -> Result<Vec<u8>>;

    /// The server URL this transport was initialized with.
    fn url(&self) -> &str;
}

struct HttpReply {
    status: u16,
    body: Vec<u8>,
    server: Option<IpAddr>,
}

/// One HTTP POST exchange. Split out so tests can substitute the network.
#[async_trait]
trait Exchange: Send + Sync {
    async fn round_trip(&self, body: Vec<u8>) -> Result<HttpReply>;
}

pub struct DohTransport {
    url: String,
    ips: Arc<IpSet>,
    listener: Option<Arc<dyn DohListener>>,
    exchange: Box<dyn Exchange>,
}

impl std::fmt::Debug for DohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohTransport").field("url", &self.url).finish_non_exhaustive()
    }
}

impl DohTransport {
    /// Build a transport for `rawurl`, seeding its address set with
    /// `bootstrap` entries (IP literals or host names) on top of a
    /// best-effort system resolution of the URL hostname.
    pub async fn new(
        rawurl: &str,
        bootstrap: &[String],
        listener: Option<Arc<dyn DohListener>>,
    ) -> Result<Self> {
        let parsed =
            Url::parse(rawurl).map_err(|e| DohError::Config(format!("invalid URL: {e}")))?;
        if parsed.scheme() != "https" {
            return Err(DohError::Config(format!(
                "bad scheme: {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| DohError::Config("URL has no host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(443);

        let map = IpMap::new();
        let ips = map.get(&host).await;
        for addr in bootstrap {
            ips.add(addr).await;
        }
        if ips.is_empty() {
            return Err(DohError::Config(format!("no IP addresses for {host}")));
        }

        let exchange = NetExchange::new(rawurl, host, port, Arc::clone(&ips))?;
        Ok(Self {
            url: rawurl.to_string(),
            ips,
            listener,
            exchange: Box::new(exchange),
        })
    }

    #[cfg(test)]
    fn with_exchange(
        url: &str,
        ips: Arc<IpSet>,
        listener: Option<Arc<dyn DohListener>>,
        exchange: Box<dyn Exchange>,
    ) -> Self {
        Self {
            url: url.to_string(),
            ips,
            listener,
            exchange,
        }
    }

    /// The transport's address set; the confirmed entry tracks the last
    /// server that completed a query.
    pub fn addresses(&self) -> Arc<IpSet> {
        Arc::clone(&self.ips)
    }

    async fn do_query(&self, q: &[u8]) -> (Result<Vec<u8>>, String) {
        if q.len() < 2 {
            return (Err(DohError::BadQuery(q.len())), String::new());
        }
        let (id0, id1) = (q[0], q[1]);

        // Zero the query ID so identical questions produce identical bodies.
        let mut body = q.to_vec();
        body[0] = 0;
        body[1] = 0;
        let body = match add_edns_padding(&body) {
            Ok(padded) => padded,
            Err(e) => {
                debug!(error = %e, "could not pad query, sending as-is");
                body
            }
        };

        let reply = match self.exchange.round_trip(body).await {
            Ok(reply) => reply,
            Err(e) => return (Err(e), String::new()),
        };
        let server = reply.server.map(|ip| ip.to_string()).unwrap_or_default();

        if !(200..300).contains(&reply.status) {
            return (Err(DohError::HttpStatus(reply.status)), server);
        }
        let mut response = reply.body;
        if response.len() < 2 {
            return (
                Err(DohError::BadResponse(format!(
                    "response length is {}",
                    response.len()
                ))),
                server,
            );
        }
        // Restore the query ID in place.
        response[0] = id0;
        response[1] = id1;

        // Record a working address for this server.
        if let Some(ip) = reply.server {
            self.ips.confirm(ip);
        }
        (Ok(response), server)
    }
}

#[async_trait]
impl Transport for DohTransport {
    async fn query(&self, q: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();
        let (result, server) = self.do_query(q).await;
        if let Some(listener) = &self.listener {
            let status = match &result {
                Ok(_) => QueryStatus::Complete,
                Err(e) => e.status(),
            };
            listener.on_transaction(&Summary {
                latency: start.elapsed().as_secs_f64(),
                query: q.to_vec(),
                response: result.as_deref().unwrap_or_default().to_vec(),
                server,
                status: status.code(),
            });
        }
        result
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Clone)]
struct PooledH2 {
    send: h2::client::SendRequest<Bytes>,
    server: IpAddr,
}

/// The real network path: dial through the address set, TLS with ALPN, then
/// either a pooled h2 connection or a one-shot HTTP/1.1 request.
struct NetExchange {
    uri: http::Uri,
    host: String,
    port: u16,
    ips: Arc<IpSet>,
    dialer: Dialer,
    tls: TlsConnector,
    h2: tokio::sync::Mutex<Option<PooledH2>>,
}

impl NetExchange {
    fn new(rawurl: &str, host: String, port: u16, ips: Arc<IpSet>) -> Result<Self> {
        let uri: http::Uri = rawurl
            .parse()
            .map_err(|e| DohError::Config(format!("invalid URL: {e}")))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Self {
            uri,
            host,
            port,
            ips,
            dialer: Dialer::with_timeout(DIAL_TIMEOUT),
            tls: TlsConnector::from(Arc::new(config)),
            h2: tokio::sync::Mutex::new(None),
        })
    }

    /// Multi-IP fallback dial: confirmed address first, then the rest of the
    /// set in insertion order. Every attempt goes through the retrying
    /// splitter so the TLS ClientHello to the DoH server is protected too.
    async fn dial(&self) -> Result<(Retrier, IpAddr)> {
        let confirmed = self.ips.confirmed();
        if let Some(ip) = confirmed {
            debug!(%ip, "trying confirmed address");
            match dial_with_split_retry(&self.dialer, SocketAddr::new(ip, self.port), None).await {
                Ok(conn) => return Ok((conn, ip)),
                Err(e) => {
                    debug!(%ip, error = %e, "confirmed address failed");
                    self.ips.disconfirm(ip);
                }
            }
        }
        let mut last_err: Option<std::io::Error> = None;
        for ip in self.ips.all() {
            if Some(ip) == confirmed {
                // Don't try this address twice.
                continue;
            }
            match dial_with_split_retry(&self.dialer, SocketAddr::new(ip, self.port), None).await {
                Ok(conn) => {
                    info!(%ip, "found working address");
                    return Ok((conn, ip));
                }
                Err(e) => {
                    debug!(%ip, error = %e, "address failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => DohError::SendFailed(e.to_string()),
            None => DohError::SendFailed("no addresses to dial".to_string()),
        })
    }

    async fn connect_tls(&self) -> Result<(TlsStream<Retrier>, IpAddr)> {
        let (conn, ip) = self.dial().await?;
        let name = ServerName::try_from(self.host.clone())
            .map_err(|e| DohError::Config(format!("invalid server name: {e}")))?;
        let stream = self
            .tls
            .connect(name, conn)
            .await
            .map_err(|e| DohError::SendFailed(format!("TLS handshake failed: {e}")))?;
        Ok((stream, ip))
    }

    async fn h2_request(
        &self,
        send: h2::client::SendRequest<Bytes>,
        server: IpAddr,
        body: &[u8],
    ) -> Result<HttpReply> {
        let mut send = send
            .ready()
            .await
            .map_err(|e| DohError::SendFailed(e.to_string()))?;
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(self.uri.clone())
            .header(http::header::CONTENT_TYPE, MIME_TYPE)
            .header(http::header::ACCEPT, MIME_TYPE)
            .header(http::header::USER_AGENT, USER_AGENT)
            .header(http::header::CONTENT_LENGTH, body.len())
            .body(())
            .map_err(|e| DohError::Internal(e.to_string()))?;

        let (response, mut stream) = send
            .send_request(request, false)
            .map_err(|e| DohError::SendFailed(e.to_string()))?;
        stream
            .send_data(Bytes::copy_from_slice(body), true)
            .map_err(|e| DohError::SendFailed(e.to_string()))?;

        let response = response
            .await
            .map_err(|e| DohError::SendFailed(e.to_string()))?;
        let status = response.status().as_u16();
        let mut recv = response.into_body();
        let mut out = Vec::new();
        while let Some(chunk) = futures::future::poll_fn(|cx| recv.poll_data(cx)).await {
            let chunk = chunk.map_err(|e| DohError::BadResponse(e.to_string()))?;
            out.extend_from_slice(&chunk);
            let _ = recv.flow_control().release_capacity(chunk.len());
        }
        Ok(HttpReply {
            status,
            body: out,
            server: Some(server),
        })
    }

    /// One-shot request in HTTP/1.1 framing for servers that refuse h2.
    async fn http1_request(
        &self,
        mut stream: TlsStream<Retrier>,
        server: IpAddr,
        body: &[u8],
    ) -> Result<HttpReply> {
        let path = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let head = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Content-Type: {MIME_TYPE}\r\n\
             Accept: {MIME_TYPE}\r\n\
             User-Agent: {USER_AGENT}\r\n\
             Content-Length: {len}\r\n\
             Connection: close\r\n\r\n",
            host = self.host,
            len = body.len(),
        );
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|e| DohError::SendFailed(e.to_string()))?;
        stream
            .write_all(body)
            .await
            .map_err(|e| DohError::SendFailed(e.to_string()))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| DohError::BadResponse(e.to_string()))?;

        let header_end = find_subsequence(&raw, b"\r\n\r\n")
            .ok_or_else(|| DohError::BadResponse("truncated HTTP response".to_string()))?;
        let head = String::from_utf8_lossy(&raw[..header_end]);
        let status = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| DohError::BadResponse("malformed status line".to_string()))?;
        Ok(HttpReply {
            status,
            body: raw[header_end + 4..].to_vec(),
            server: Some(server),
        })
    }
}

#[async_trait]
impl Exchange for NetExchange {
    async fn round_trip(&self, body: Vec<u8>) -> Result<HttpReply> {
        // Reuse the pooled h2 connection while it stays healthy.
        let pooled = self.h2.lock().await.clone();
        if let Some(p) = pooled {
            match self.h2_request(p.send, p.server, &body).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(error = %e, "pooled connection failed, re-dialing");
                    *self.h2.lock().await = None;
                }
            }
        }

        let (stream, ip) = self.connect_tls().await?;
        let is_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
        if !is_h2 {
            return self.http1_request(stream, ip, &body).await;
        }

        let (send, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| DohError::SendFailed(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("h2 connection terminated: {e}");
            }
        });
        let reply = self.h2_request(send.clone(), ip, &body).await?;
        *self.h2.lock().await = Some(PooledH2 { send, server: ip });
        Ok(reply)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
