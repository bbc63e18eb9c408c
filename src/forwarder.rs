//! DNS-over-TCP forwarder.
//!
//! Bridges a stub resolver's stream onto a [`DnsTransport`]: queries arrive
//! with the RFC 1035 §4.2.2 two-byte length prefix, each one is resolved in
//! its own task, and responses are framed back the same way. Responses may
//! come back in any order; the stub correlates them by DNS ID.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;

use crate::transport::DnsTransport;

/// Write side shared by the workers; `None` once the stream is closed.
type SharedWriter<S> = Arc<Mutex<Option<WriteHalf<S>>>>;

/// Serve DNS-over-TCP on `stream`, resolving every query through
/// `transport`. Runs until the stream ends or errors, closing it on exit.
/// Workers that outlive the stream have their writes dropped silently.
pub async fn accept<S>(transport: Arc<dyn DnsTransport>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer: SharedWriter<S> = Arc::new(Mutex::new(Some(writer)));

    loop {
        let mut lbuf = [0u8; 2];
        if reader.read_exact(&mut lbuf).await.is_err() {
            break;
        }
        let qlen = u16::from_be_bytes(lbuf) as usize;
        let mut query = vec![0u8; qlen];
        if reader.read_exact(&mut query).await.is_err() {
            break;
        }
        tokio::spawn(forward_query(transport.clone(), query, writer.clone()));
    }

    close(&writer).await;
}

/// Resolve one query and write the framed response. Any failure closes the
/// stream, which in turn ends the accept loop.
async fn forward_query<S>(transport: Arc<dyn DnsTransport>, query: Vec<u8>, writer: SharedWriter<S>)
where
    S: AsyncWrite + Send + 'static,
{
    let response = match transport.query(&query).await {
        Ok(r) => r,
        Err(e) => {
            log::debug!("query failed: {e}");
            close(&writer).await;
            return;
        }
    };
    if response.len() > u16::MAX as usize {
        log::warn!("dropping oversize response: {} bytes", response.len());
        close(&writer).await;
        return;
    }

    // Length prefix and payload go out as one buffer in one write; separate
    // writes could interleave with another worker's response.
    let mut frame = Vec::with_capacity(2 + response.len());
    frame.extend_from_slice(&(response.len() as u16).to_be_bytes());
    frame.extend_from_slice(&response);

    let mut guard = writer.lock().await;
    if let Some(w) = guard.as_mut() {
        if w.write_all(&frame).await.is_err() {
            if let Some(mut w) = guard.take() {
                let _ = w.shutdown().await;
            }
        }
    }
}

async fn close<S>(writer: &SharedWriter<S>)
where
    S: AsyncWrite + Send + 'static,
{
    let mut guard = writer.lock().await;
    if let Some(mut w) = guard.take() {
        let _ = w.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::error::{Error, Result};

    /// Transport fake driven by channels: observed queries flow out, canned
    /// responses flow in.
    struct FakeTransport {
        queries: mpsc::UnboundedSender<Vec<u8>>,
        responses: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl FakeTransport {
        fn new() -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<Vec<u8>>,
            mpsc::UnboundedSender<Vec<u8>>,
        ) {
            let (query_tx, query_rx) = mpsc::unbounded_channel();
            let (response_tx, response_rx) = mpsc::unbounded_channel();
            let fake = Arc::new(Self {
                queries: query_tx,
                responses: Mutex::new(response_rx),
                fail: AtomicBool::new(false),
            });
            (fake, query_rx, response_tx)
        }
    }

    #[async_trait]
    impl DnsTransport for FakeTransport {
        async fn query(&self, q: &[u8]) -> Result<Vec<u8>> {
            self.queries.send(q.to_vec()).unwrap();
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::SendFailed("fake error".to_string()));
            }
            let mut responses = self.responses.lock().await;
            responses
                .recv()
                .await
                .ok_or_else(|| Error::SendFailed("fake closed".to_string()))
        }

        fn url(&self) -> &str {
            "fake"
        }
    }

    #[tokio::test]
    async fn forwards_query_and_frames_response() {
        let (fake, mut queries, responses) = FakeTransport::new();
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(accept(fake, server));

        client.write_all(&[0x00, 0x05]).await.unwrap();
        client.write_all(&[1, 2, 3, 4, 5]).await.unwrap();

        assert_eq!(queries.recv().await.unwrap(), vec![1, 2, 3, 4, 5]);
        responses.send(vec![5, 4, 3, 2, 1]).unwrap();

        let mut lbuf = [0u8; 2];
        client.read_exact(&mut lbuf).await.unwrap();
        assert_eq!(u16::from_be_bytes(lbuf), 5);
        let mut resp = [0u8; 5];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn query_failure_closes_the_stream() {
        let (fake, mut queries, _responses) = FakeTransport::new();
        fake.fail.store(true, Ordering::SeqCst);
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(accept(fake, server));

        client.write_all(&[0x00, 0x05]).await.unwrap();
        client.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        assert_eq!(queries.recv().await.unwrap(), vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 2];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn late_response_after_client_close_is_absorbed() {
        let (fake, mut queries, responses) = FakeTransport::new();
        let (mut client, server) = tokio::io::duplex(1024);
        let served = tokio::spawn(accept(fake, server));

        client.write_all(&[0x00, 0x05]).await.unwrap();
        client.write_all(&[1, 2, 3, 4, 5]).await.unwrap();
        assert_eq!(queries.recv().await.unwrap(), vec![1, 2, 3, 4, 5]);

        // The stub goes away before the response arrives.
        drop(client);
        responses.send(vec![5, 4, 3, 2, 1]).unwrap();

        // The loop ends cleanly; the worker's write is dropped.
        served.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_response_closes_the_stream() {
        let (fake, mut queries, responses) = FakeTransport::new();
        let (mut client, server) = tokio::io::duplex(1 << 17);
        tokio::spawn(accept(fake, server));

        client.write_all(&[0x00, 0x01]).await.unwrap();
        client.write_all(&[9]).await.unwrap();
        assert_eq!(queries.recv().await.unwrap(), vec![9]);
        responses.send(vec![0; 70_000]).unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_queries_each_get_a_framed_response() {
        let (fake, mut queries, responses) = FakeTransport::new();
        let (mut client, server) = tokio::io::duplex(1024);
        tokio::spawn(accept(fake, server));

        client.write_all(&[0x00, 0x01, 1]).await.unwrap();
        client.write_all(&[0x00, 0x01, 2]).await.unwrap();
        queries.recv().await.unwrap();
        queries.recv().await.unwrap();

        responses.send(vec![9, 9]).unwrap();
        responses.send(vec![9, 9]).unwrap();

        for _ in 0..2 {
            let mut lbuf = [0u8; 2];
            client.read_exact(&mut lbuf).await.unwrap();
            assert_eq!(u16::from_be_bytes(lbuf), 2);
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [9, 9]);
        }
    }
}
