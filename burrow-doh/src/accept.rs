//! DNS-over-TCP stub acceptor.
//!
//! Stub resolvers that insist on TCP get their length-framed queries bridged
//! onto a [`Transport`]. Queries run concurrently; responses are written
//! length-prefixed in a single combined write so they never interleave.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DohError, Result};
use crate::transport::Transport;

/// Maximum DNS-over-TCP message size; a response that does not fit in the
/// 16-bit length prefix is a protocol violation.
const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Bridge a DNS-over-TCP stream onto `transport` until it closes.
///
/// Any failed query closes the whole stream; the stub resolver re-opens it.
pub async fn accept<S>(transport: Arc<dyn Transport>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, wr) = tokio::io::split(stream);
    let wr = Arc::new(tokio::sync::Mutex::new(wr));
    let failed = CancellationToken::new();

    loop {
        let mut length = [0u8; 2];
        let read = tokio::select! {
            _ = failed.cancelled() => break,
            read = rd.read_exact(&mut length) => read,
        };
        if read.is_err() {
            // A short or empty length prefix is a clean shutdown.
            debug!("TCP query socket shutdown");
            break;
        }
        let qlen = u16::from_be_bytes(length) as usize;
        let mut query = vec![0u8; qlen];
        let read = tokio::select! {
            _ = failed.cancelled() => break,
            read = rd.read_exact(&mut query) => read,
        };
        if let Err(e) = read {
            warn!(error = %e, "error reading query");
            break;
        }

        let transport = Arc::clone(&transport);
        let wr = Arc::clone(&wr);
        let failed = failed.clone();
        tokio::spawn(async move {
            if let Err(e) = forward_query(transport, query, wr).await {
                warn!(error = %e, "query forwarding failed");
                failed.cancel();
            }
        });
    }

    let _ = wr.lock().await.shutdown().await;
}

/// Perform one query and write its length-prefixed response.
async fn forward_query<W>(
    transport: Arc<dyn Transport>,
    query: Vec<u8>,
    wr: Arc<tokio::sync::Mutex<W>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = transport.query(&query).await?;
    if response.len() > MAX_MESSAGE_SIZE {
        return Err(DohError::BadResponse(format!(
            "oversize response: {}",
            response.len()
        )));
    }
    // One combined buffer; writes from concurrent responses must not
    // interleave.
    let mut framed = Vec::with_capacity(response.len() + 2);
    framed.extend_from_slice(&(response.len() as u16).to_be_bytes());
    framed.extend_from_slice(&response);
    wr.lock().await.write_all(&framed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedTransport {
        queries: Mutex<Vec<Vec<u8>>>,
        response: Mutex<Option<Result<Vec<u8>>>>,
    }

    impl ScriptedTransport {
        fn replying(response: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                queries: Mutex::new(Vec::new()),
                response: Mutex::new(Some(Ok(response))),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                queries: Mutex::new(Vec::new()),
                response: Mutex::new(Some(Err(DohError::SendFailed("scripted".into())))),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn query(&self, q: &[u8]) -> Result<Vec<u8>> {
            self.queries.lock().push(q.to_vec());
            self.response
                .lock()
                .take()
                .unwrap_or_else(|| Ok(vec![0, 0]))
        }

        fn url(&self) -> &str {
            "https://fake.example/dns-query"
        }
    }

    fn frame(query: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(query.len() + 2);
        out.extend_from_slice(&(query.len() as u16).to_be_bytes());
        out.extend_from_slice(query);
        out
    }

    #[tokio::test]
    async fn query_round_trip() {
        let transport = ScriptedTransport::replying(vec![1, 2, 8, 9, 10]);
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(accept(transport.clone(), server));

        client
            .write_all(&frame(&[0xbe, 0xef, 0, 1]))
            .await
            .unwrap();

        let mut length = [0u8; 2];
        client.read_exact(&mut length).await.unwrap();
        assert_eq!(u16::from_be_bytes(length), 5);
        let mut response = vec![0u8; 5];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, vec![1, 2, 8, 9, 10]);
        assert_eq!(transport.queries.lock()[0], vec![0xbe, 0xef, 0, 1]);
    }

    #[tokio::test]
    async fn failed_query_closes_the_stream() {
        let transport = ScriptedTransport::failing();
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(accept(transport, server));

        client
            .write_all(&frame(&[0xbe, 0xef, 0, 1]))
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "acceptor must close the stream on query failure");
    }

    #[tokio::test]
    async fn oversize_response_closes_the_stream() {
        let transport = ScriptedTransport::replying(vec![0u8; 65_536]);
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(accept(transport, server));

        client
            .write_all(&frame(&[0xbe, 0xef, 0, 1]))
            .await
            .unwrap();

        let mut buf = [0u8; 2];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn short_length_prefix_is_clean_shutdown() {
        let transport = ScriptedTransport::replying(vec![0, 0]);
        let (mut client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(accept(transport.clone(), server));

        client.write_all(&[0x00]).await.unwrap();
        drop(client);
        handle.await.unwrap();
        assert!(transport.queries.lock().is_empty());
    }

    #[tokio::test]
    async fn responses_do_not_interleave() {
        // Two concurrent queries; both responses must arrive intact.
        let transport = ScriptedTransport::replying(vec![9; 300]);
        let (mut client, server) = tokio::io::duplex(65_536);
        tokio::spawn(accept(transport, server));

        let mut request = frame(&[0xaa, 0xbb, 1]);
        request.extend_from_slice(&frame(&[0xcc, 0xdd, 2]));
        client.write_all(&request).await.unwrap();

        for _ in 0..2 {
            let mut length = [0u8; 2];
            client.read_exact(&mut length).await.unwrap();
            let mut body = vec![0u8; u16::from_be_bytes(length) as usize];
            client.read_exact(&mut body).await.unwrap();
            assert!(body == vec![9; 300] || body == vec![0, 0]);
        }
    }
}
