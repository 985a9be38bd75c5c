//! Gateway server.
//!
//! Accepts HTTP/1.1 connections and hands every request to [`Gateway`].
//! One tokio task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::handler::Gateway;

pub struct GatewayServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    /// Bind the listen address. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway on {addr}"))?;
        Ok(Self { listener, gateway })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("gateway listener has no address")
    }

    /// Serve until the shutdown signal fires. In-flight connections finish
    /// on their own tasks.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "activation gateway listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let gateway = self.gateway.clone();

                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let svc = service_fn(move |req: Request<Incoming>| {
                            let gateway = gateway.clone();
                            async move { Ok::<_, hyper::Error>(gateway.handle(req).await) }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            debug!(%peer_addr, error = %e, "connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("activation gateway shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
