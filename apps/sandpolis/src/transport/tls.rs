use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::TransportError;

/// How the client wraps its TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Plain TCP.
    Disabled,
    /// Verify the server against the bundled web PKI roots.
    #[default]
    SystemRoots,
    /// Verify the server against the certificates in a PEM file.
    Ca(PathBuf),
}

impl FromStr for TlsPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some(path) = value.strip_prefix("ca:") {
            if path.is_empty() {
                return Err("ca: requires a certificate path".to_string());
            }
            return Ok(TlsPolicy::Ca(PathBuf::from(path)));
        }
        match value.to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" | "0" | "false" => Ok(TlsPolicy::Disabled),
            "system" | "on" | "1" | "true" => Ok(TlsPolicy::SystemRoots),
            other => Err(format!("unknown tls policy '{other}' (expected off, system or ca:<path>)")),
        }
    }
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsPolicy::Disabled => f.write_str("off"),
            TlsPolicy::SystemRoots => f.write_str("system"),
            TlsPolicy::Ca(path) => write!(f, "ca:{}", path.display()),
        }
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds a connector for `policy`; `None` for plain TCP.
pub fn connector(policy: &TlsPolicy) -> Result<Option<TlsConnector>, TransportError> {
    let mut roots = RootCertStore::empty();
    match policy {
        TlsPolicy::Disabled => return Ok(None),
        TlsPolicy::SystemRoots => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        TlsPolicy::Ca(path) => {
            let (added, _) = roots.add_parsable_certificates(load_certs(path)?);
            if added == 0 {
                return Err(TransportError::InvalidConfig(format!(
                    "no usable certificates in {}",
                    path.display()
                )));
            }
        }
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::Tls(err.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Some(TlsConnector::from(Arc::new(config))))
}

/// Builds a server-side acceptor from a PEM certificate chain and key.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(TransportError::InvalidConfig(format!(
            "no certificates in {}",
            cert_path.display()
        )));
    }
    let key = load_key(key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::Tls(err.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| TransportError::Tls(err.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TransportError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TransportError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TransportError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| {
            TransportError::InvalidConfig(format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn parses_policies() {
        assert_eq!("off".parse::<TlsPolicy>().unwrap(), TlsPolicy::Disabled);
        assert_eq!("System".parse::<TlsPolicy>().unwrap(), TlsPolicy::SystemRoots);
        assert_eq!(
            "ca:/etc/sandpolis/ca.pem".parse::<TlsPolicy>().unwrap(),
            TlsPolicy::Ca(PathBuf::from("/etc/sandpolis/ca.pem"))
        );
        assert!("ca:".parse::<TlsPolicy>().is_err());
        assert!("maybe".parse::<TlsPolicy>().is_err());
    }

    #[test_timeout::timeout]
    fn display_round_trips() {
        for policy in [
            TlsPolicy::Disabled,
            TlsPolicy::SystemRoots,
            TlsPolicy::Ca(PathBuf::from("ca.pem")),
        ] {
            assert_eq!(policy.to_string().parse::<TlsPolicy>().unwrap(), policy);
        }
    }

    #[test_timeout::timeout]
    fn connector_reports_missing_ca_file() {
        let policy = TlsPolicy::Ca(PathBuf::from("/nonexistent/sandpolis-ca.pem"));
        assert!(matches!(connector(&policy), Err(TransportError::Io { .. })));
        assert!(connector(&TlsPolicy::Disabled).unwrap().is_none());
        assert!(connector(&TlsPolicy::SystemRoots).unwrap().is_some());
    }
}
