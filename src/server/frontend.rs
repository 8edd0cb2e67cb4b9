// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide server state and the TCP accept loop (§4.4, §6).

use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{error, info, warn};

use crate::{
    codec::CodecRegistry,
    error::Result,
    option::server_handshake,
    registry::{ServiceDesc, ServiceRegistry},
    server::{connect, session::ServerSession},
};

/// A running RPC endpoint: a service registry plus the set of codecs it is
/// willing to negotiate. One `Server` can back any number of accepted
/// connections, each handled by its own [`ServerSession`].
#[derive(Clone, Default)]
pub struct Server {
    registry: Arc<ServiceRegistry>,
    codecs: Arc<CodecRegistry>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codecs(codecs: CodecRegistry) -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::new()),
            codecs: Arc::new(codecs),
        }
    }

    /// Registers a service, built via [`crate::registry::ServiceBuilder`].
    pub fn register(&self, service: Arc<ServiceDesc>) -> Result<()> {
        self.registry.register(service)
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Binds `addr` and serves forever, spawning one detached task per
    /// accepted connection (mirrors the teacher's `connect()` pattern of
    /// handing each socket its own task rather than a worker pool).
    pub async fn serve(self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(local_addr = ?listener.local_addr().ok(), "rpc server: listening");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "rpc server: accept error");
                    continue;
                },
            };
            socket.set_nodelay(true).ok();
            info!(%peer, "rpc server: accepted connection");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_conn(socket).await {
                    error!(%peer, error = %e, "rpc server: connection error");
                }
            });
        }
    }

    /// Runs the handshake and resulting session on one already-accepted
    /// stream. Exposed separately from [`Server::serve`] so the HTTP CONNECT
    /// adapter can hand over a hijacked stream the same way.
    pub async fn serve_conn(&self, stream: impl crate::codec::Stream) -> Result<()> {
        let (codec, opt) = server_handshake(stream, &self.codecs).await?;
        let session = ServerSession::new(Arc::clone(&self.registry), codec, opt.handle_timeout());
        session.serve().await;
        Ok(())
    }

    /// Like [`Server::serve`], but every accepted connection is first routed
    /// through the HTTP `CONNECT`/`/debug/mrpc` dispatcher (§6) instead of
    /// going straight into the handshake. `connect_path` is typically
    /// [`connect::DEFAULT_CONNECT_PATH`].
    pub async fn serve_http(self, addr: impl ToSocketAddrs, connect_path: &'static str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(local_addr = ?listener.local_addr().ok(), "rpc server: listening (http adapter)");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "rpc server: accept error");
                    continue;
                },
            };
            socket.set_nodelay(true).ok();

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = connect::handle(&server, socket, connect_path).await {
                    error!(%peer, error = %e, "rpc server: connect dispatch error");
                }
            });
        }
    }
}
