mod responder;

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::session::{ServerContext, Session, SessionConfig};
use crate::transport::{Connection, TransportError};

pub use responder::TreeResponder;

/// Accepts TCP connections and runs one server session per connection.
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    context: ServerContext,
    config: SessionConfig,
}

impl Server {
    pub async fn bind(
        address: &str,
        tls: Option<TlsAcceptor>,
        context: ServerContext,
        config: SessionConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| TransportError::Bind {
                address: address.to_string(),
                source,
            })?;
        Ok(Self {
            listener,
            tls,
            context,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                address: "listener".into(),
                source,
            })
    }

    /// Runs the accept loop until the task is dropped.
    pub async fn run(self) {
        tracing::info!(
            target = "sandpolis::server",
            address = ?self.listener.local_addr().ok(),
            tls = self.tls.is_some(),
            server_cvid = self.context.local_cvid(),
            "listening"
        );
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(
                        target = "sandpolis::server",
                        error = %err,
                        "accept failed"
                    );
                    continue;
                }
            };
            tracing::debug!(target = "sandpolis::server", %peer, "accepted connection");
            let tls = self.tls.clone();
            let context = self.context.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                serve_connection(stream, peer, tls, context, config).await;
            });
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    context: ServerContext,
    config: SessionConfig,
) {
    let _ = stream.set_nodelay(true);
    let io: Connection = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => Box::new(stream),
            Err(err) => {
                tracing::warn!(
                    target = "sandpolis::server",
                    %peer,
                    error = %err,
                    "tls handshake failed"
                );
                return;
            }
        },
        None => Box::new(stream),
    };

    match Session::accept(io, config, &context).await {
        Ok(session) => {
            session.closed().await;
            tracing::debug!(
                target = "sandpolis::server",
                %peer,
                "connection finished"
            );
        }
        Err(err) => {
            tracing::warn!(
                target = "sandpolis::server",
                %peer,
                error = %err,
                "session handshake failed"
            );
        }
    }
}
