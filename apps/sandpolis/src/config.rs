use std::env;
use std::time::Duration;

use crate::transport::TlsPolicy;

pub const DEFAULT_SERVER: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8768;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings, including the remembered auto-login credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsPolicy,
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let server = env::var("SANDPOLIS_SERVER").unwrap_or_else(|_| DEFAULT_SERVER.to_string());
        // Normalize localhost to IPv4 so the TLS name and the socket agree
        let server = if server == "localhost" {
            DEFAULT_SERVER.to_string()
        } else {
            server
        };

        let port = parse_or("SANDPOLIS_PORT", DEFAULT_PORT);
        let tls = parse_or("SANDPOLIS_TLS", TlsPolicy::default());
        let request_timeout = env::var("SANDPOLIS_REQUEST_TIMEOUT_MS")
            .ok()
            .map(|raw| match raw.parse::<u64>() {
                Ok(millis) => Duration::from_millis(millis),
                Err(_) => {
                    tracing::warn!(
                        target = "sandpolis::config",
                        value = %raw,
                        "invalid SANDPOLIS_REQUEST_TIMEOUT_MS; using default"
                    );
                    DEFAULT_REQUEST_TIMEOUT
                }
            })
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        Self {
            server,
            port,
            username: env::var("SANDPOLIS_USERNAME").ok().filter(|v| !v.is_empty()),
            password: env::var("SANDPOLIS_PASSWORD").ok(),
            tls,
            request_timeout,
        }
    }

    /// Credentials for auto-login, when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some((username, password)),
            _ => None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            tls: TlsPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn parse_or<T>(var: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match env::var(var) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(
                    target = "sandpolis::config",
                    var,
                    value = %raw,
                    "invalid value; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "SANDPOLIS_SERVER",
        "SANDPOLIS_PORT",
        "SANDPOLIS_USERNAME",
        "SANDPOLIS_PASSWORD",
        "SANDPOLIS_TLS",
        "SANDPOLIS_REQUEST_TIMEOUT_MS",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_without_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        let config = ClientConfig::from_env();
        assert_eq!(config, ClientConfig::default());
        assert!(config.credentials().is_none());
    }

    #[test]
    fn environment_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        env::set_var("SANDPOLIS_SERVER", "localhost");
        env::set_var("SANDPOLIS_PORT", "9000");
        env::set_var("SANDPOLIS_USERNAME", "admin");
        env::set_var("SANDPOLIS_PASSWORD", "hunter2");
        env::set_var("SANDPOLIS_TLS", "off");
        env::set_var("SANDPOLIS_REQUEST_TIMEOUT_MS", "250");

        let config = ClientConfig::from_env();
        clear();

        assert_eq!(config.server, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.credentials(), Some(("admin", "hunter2")));
        assert_eq!(config.tls, TlsPolicy::Disabled);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        env::set_var("SANDPOLIS_PORT", "not-a-port");
        env::set_var("SANDPOLIS_REQUEST_TIMEOUT_MS", "-5");

        let config = ClientConfig::from_env();
        clear();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }
}
