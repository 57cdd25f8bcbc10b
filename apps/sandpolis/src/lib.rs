pub mod auth;
pub mod cli;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use session::{Session, SessionConfig, SessionError};
pub use transport::TlsPolicy;

/// Connects to `address:port` and completes the handshake with default
/// session settings.
pub async fn connect(address: &str, port: u16, tls: &TlsPolicy) -> Result<Session, SessionError> {
    Session::connect(address, port, tls, SessionConfig::default()).await
}
