//! Minimal HTTP/1.1 client.
//!
//! One TCP connection per request, driven by hyper's low-level `conn` API.
//! Shared by the REST backend, the readiness probe and the gateway proxy.

use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::debug;

/// Errors from a single request/response exchange.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to {authority} failed: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("reading response body failed: {0}")]
    Body(#[source] hyper::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

/// Send `req` to `authority` (`host:port`) and buffer the whole response.
///
/// `timeout` bounds the entire exchange, connect included.
pub async fn send(
    authority: &str,
    req: Request<Full<Bytes>>,
    timeout: Duration,
) -> Result<Response<Bytes>, ClientError> {
    match tokio::time::timeout(timeout, exchange(authority, req)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%authority, ?timeout, "http request timed out");
            Err(ClientError::TimedOut(timeout))
        }
    }
}

async fn exchange(
    authority: &str,
    req: Request<Full<Bytes>>,
) -> Result<Response<Bytes>, ClientError> {
    let stream = tokio::net::TcpStream::connect(authority)
        .await
        .map_err(|source| ClientError::Connect {
            authority: authority.to_string(),
            source,
        })?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(ClientError::Handshake)?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "client connection closed with error");
        }
    });

    let resp = sender.send_request(req).await.map_err(ClientError::Request)?;
    let (parts, body) = resp.into_parts();
    let body = body.collect().await.map_err(ClientError::Body)?.to_bytes();
    Ok(Response::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn get(authority: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri("/ping")
            .header("host", authority)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn send_reads_full_response() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 201 Created\r\ncontent-length: 4\r\nx-up: yes\r\n\r\npong")
                .await
                .unwrap();
        });

        let resp = send(&addr, get(&addr), Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(resp.headers()["x-up"], "yes");
        assert_eq!(resp.body().as_ref(), b"pong");
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let err = send("127.0.0.1:1", get("127.0.0.1:1"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = send(&addr, get(&addr), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
