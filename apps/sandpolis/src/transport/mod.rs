pub mod framed;
pub mod tls;

use std::path::PathBuf;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub use framed::{FrameDecoder, FrameError, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
pub use tls::TlsPolicy;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {source}")]
    ConnectFailed {
        address: String,
        source: std::io::Error,
    },
    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
    #[error("tls negotiation failed: {0}")]
    Tls(String),
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Any ordered, reliable byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type Connection = Box<dyn AsyncStream>;

/// Opens a TCP connection and wraps it according to `tls`.
pub async fn connect(address: &str, port: u16, tls: &TlsPolicy) -> Result<Connection, TransportError> {
    let target = format!("{address}:{port}");
    let connector = tls::connector(tls)?;

    let stream = TcpStream::connect(&target)
        .await
        .map_err(|source| TransportError::ConnectFailed {
            address: target.clone(),
            source,
        })?;
    stream
        .set_nodelay(true)
        .map_err(|source| TransportError::ConnectFailed {
            address: target.clone(),
            source,
        })?;
    tracing::debug!(target = "sandpolis::transport", address = %target, tls = %tls, "tcp connected");

    let Some(connector) = connector else {
        return Ok(Box::new(stream));
    };
    let server_name = ServerName::try_from(address.to_string())
        .map_err(|err| TransportError::InvalidConfig(format!("invalid server name: {err}")))?;
    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|err| TransportError::Tls(err.to_string()))?;
    tracing::debug!(target = "sandpolis::transport", address = %target, "tls established");
    Ok(Box::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn refused_connection_is_connect_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect("127.0.0.1", port, &TlsPolicy::Disabled).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }
}
