// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Accepting TLS connections with engines from the [`TlsEngineFactory`].

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, instrument};

use crate::{tls::TlsEngineFactory, trust::PeerMap};

/// Handles a connection once its TLS handshake has completed.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(
        &self,
        stream: SslStream<TcpStream>,
        remote_address: SocketAddr,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub struct Listener {
    /// The socket address connections are expected to arrive on. This is primarily useful for
    /// tests when binding to port 0.
    local_addr: SocketAddr,
    /// A task that is accepting incoming connections. Once halted, this task will complete once
    /// all existing connections complete.
    task: tokio::task::JoinHandle<Result<(), anyhow::Error>>,
    halt_token: CancellationToken,
}

impl Listener {
    /// Get the port number the listener accepts connections on.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await?
    }

    /// Stop accepting new connections and wait for existing connections to complete.
    ///
    /// Existing connections can run for an arbitrarily long time, so users should wrap
    /// this call in a timeout if they don't have an arbitrarily long time to wait.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }
}

/// Accept TLS connections on `address`, passing each established session to `handler`.
///
/// Accepted client certificates are recorded in `peer_map` under the peer's IP address.
/// This function returns once the TCP listener has been established.
#[instrument(skip(factory, peer_map, handler), err)]
pub async fn listen<H: ConnectionHandler>(
    address: SocketAddr,
    factory: TlsEngineFactory,
    peer_map: PeerMap,
    handler: Arc<H>,
) -> anyhow::Result<Listener> {
    let tcp_listener = TcpListener::bind(address).await?;
    let local_addr = tcp_listener.local_addr()?;
    let halt_token = CancellationToken::new();

    let task = tokio::spawn(
        inner_listen(
            tcp_listener,
            factory,
            peer_map,
            handler,
            halt_token.clone(),
        )
        .instrument(tracing::Span::current()),
    );
    tracing::info!(%local_addr, "Accepting TLS connections");
    Ok(Listener {
        local_addr,
        task,
        halt_token,
    })
}

async fn inner_listen<H: ConnectionHandler>(
    tcp_listener: TcpListener,
    factory: TlsEngineFactory,
    peer_map: PeerMap,
    handler: Arc<H>,
    halt_token: CancellationToken,
) -> anyhow::Result<()> {
    let connection_tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = halt_token.cancelled() => {
                tracing::info!("Shutdown requested, no new connections will be accepted");
                break;
            },
            accepted = tcp_listener.accept() => {
                let (tcp_stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(?error, "Failed to accept new TCP connection");
                        continue;
                    }
                };
                tracing::debug!(?remote_addr, "New TCP connection established");
                let factory = factory.clone();
                let peer_map = peer_map.clone();
                let handler = handler.clone();
                connection_tracker.spawn(
                    async move {
                        if let Err(error) =
                            serve(tcp_stream, remote_addr, &factory, &peer_map, handler.as_ref()).await
                        {
                            tracing::warn!(?error, ?remote_addr, "Connection failed");
                        }
                    }
                    .instrument(tracing::Span::current()),
                );
            }
        }
    }

    connection_tracker.close();
    connection_tracker.wait().await;
    Ok(())
}

async fn serve<H: ConnectionHandler>(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    factory: &TlsEngineFactory,
    peer_map: &PeerMap,
    handler: &H,
) -> anyhow::Result<()> {
    let remote_ip = remote_addr.ip().to_string();
    let ssl = factory.create(Some(&remote_ip), peer_map)?;
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    Pin::new(&mut stream).accept().await?;
    tracing::debug!(?remote_addr, "TLS session established");
    handler.handle(stream, remote_addr).await
}
