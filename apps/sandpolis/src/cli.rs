use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use state_tree::{Oid, Value};

use crate::config::ClientConfig;
use crate::telemetry::logging::{LogConfig, LogLevel};
use crate::transport::TlsPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "sandpolis",
    about = "Replicate and serve Sandpolis state trees",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[arg(
        long,
        global = true,
        help = "Print Prometheus text metrics to stderr before exiting"
    )]
    pub metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "SANDPOLIS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "SANDPOLIS_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "log-filter",
        value_name = "DIRECTIVES",
        global = true,
        env = "SANDPOLIS_LOG_FILTER",
        help = "tracing filter directives; overrides --log-level"
    )]
    pub filter: Option<String>,

    #[arg(
        long = "trace-deps",
        global = true,
        env = "SANDPOLIS_TRACE_DEPS",
        help = "Keep trace output from rustls and tokio at --log-level trace"
    )]
    pub trace_deps: bool,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            filter: self.filter.clone(),
            trace_deps: self.trace_deps,
        }
    }
}

/// Overrides for the settings [`ClientConfig::from_env`] loads.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectArgs {
    #[arg(long, value_name = "HOST", help = "Server address")]
    pub server: Option<String>,

    #[arg(long, value_name = "PORT", help = "Server port")]
    pub port: Option<u16>,

    #[arg(
        long,
        value_name = "POLICY",
        value_parser = parse_tls,
        help = "TLS policy: off, system or ca:<path>"
    )]
    pub tls: Option<TlsPolicy>,

    #[arg(long, value_name = "NAME", help = "Log in as this user after connecting")]
    pub username: Option<String>,

    #[arg(long, value_name = "PASSWORD", help = "Password for --username")]
    pub password: Option<String>,

    #[arg(long = "timeout-ms", value_name = "MILLIS", help = "Request timeout; 0 waits forever")]
    pub timeout_ms: Option<u64>,
}

impl ConnectArgs {
    pub fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tls) = &self.tls {
            config.tls = tls.clone();
        }
        if let Some(username) = &self.username {
            config.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(millis) = self.timeout_ms {
            config.request_timeout = Duration::from_millis(millis);
        }
        config
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read a subtree from a server once and print it
    Snapshot(SnapshotArgs),
    /// Replicate a subtree and print every change as it arrives
    Watch(WatchArgs),
    /// Serve a state tree to clients
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(value_name = "OID", value_parser = parse_oid)]
    pub oid: Oid,

    #[arg(long, help = "Print the snapshot as JSON")]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    #[arg(value_name = "OID", value_parser = parse_oid)]
    pub oid: Oid,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "SANDPOLIS_BIND",
        default_value = "0.0.0.0:8768",
        help = "Address to listen on"
    )]
    pub bind: String,

    #[arg(long, value_name = "PATH", requires = "key", help = "PEM certificate chain")]
    pub cert: Option<PathBuf>,

    #[arg(long, value_name = "PATH", requires = "cert", help = "PEM private key")]
    pub key: Option<PathBuf>,

    #[arg(
        long = "user",
        value_name = "NAME:PASSWORD",
        value_parser = crate::auth::parse_user_spec,
        help = "Accept this login; repeatable. Without any, login is refused and everything is open"
    )]
    pub users: Vec<(String, String)>,

    #[arg(
        long = "set",
        value_name = "OID=VALUE",
        value_parser = parse_assignment,
        help = "Seed an attribute; repeatable"
    )]
    pub assignments: Vec<(Oid, Value)>,

    #[arg(long, default_value = "", help = "Namespace of the served tree")]
    pub namespace: String,
}

fn parse_tls(raw: &str) -> Result<TlsPolicy, String> {
    raw.parse()
}

fn parse_oid(raw: &str) -> Result<Oid, String> {
    Oid::parse(raw).map_err(|err| err.to_string())
}

/// Parses `OID=VALUE`. Integers and booleans keep their type, everything
/// else is a string.
pub fn parse_assignment(raw: &str) -> Result<(Oid, Value), String> {
    let (oid, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected OID=VALUE, got '{raw}'"))?;
    let oid = parse_oid(oid)?;
    let value = if let Ok(number) = value.parse::<i64>() {
        Value::Int64(number)
    } else if let Ok(flag) = value.parse::<bool>() {
        Value::Bool(flag)
    } else {
        Value::String(value.to_string())
    };
    Ok((oid, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn assignment_values_are_typed() {
        let (oid, value) = parse_assignment("/profile/abc/hostname=desktop-1").unwrap();
        assert_eq!(oid.to_string(), "/profile/abc/hostname");
        assert_eq!(value, Value::String("desktop-1".into()));

        assert_eq!(parse_assignment("/a/b=42").unwrap().1, Value::Int64(42));
        assert_eq!(parse_assignment("/a/b=true").unwrap().1, Value::Bool(true));
        assert!(parse_assignment("/a/b").is_err());
        assert!(parse_assignment("=x").is_err());
    }

    #[test_timeout::timeout]
    fn flags_override_loaded_config() {
        let args = ConnectArgs {
            port: Some(9001),
            tls: Some(TlsPolicy::Disabled),
            timeout_ms: Some(0),
            ..ConnectArgs::default()
        };
        let config = args.apply(ClientConfig::default());
        assert_eq!(config.server, "127.0.0.1");
        assert_eq!(config.port, 9001);
        assert_eq!(config.tls, TlsPolicy::Disabled);
        assert!(config.request_timeout.is_zero());
    }

    #[test_timeout::timeout]
    fn serve_arguments_parse() {
        let cli = Cli::try_parse_from([
            "sandpolis",
            "serve",
            "--bind",
            "127.0.0.1:0",
            "--user",
            "admin:hunter2",
            "--set",
            "/profile/abc/hostname=desktop-1",
        ])
        .unwrap();
        let Command::Serve(serve) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(serve.users, vec![("admin".to_string(), "hunter2".to_string())]);
        assert_eq!(serve.assignments.len(), 1);
        assert!(serve.cert.is_none());
    }

    #[test_timeout::timeout]
    fn metrics_flag_is_global() {
        let cli = Cli::try_parse_from(["sandpolis", "snapshot", "/profile/abc", "--metrics"]).unwrap();
        assert!(cli.metrics);
        let cli = Cli::try_parse_from(["sandpolis", "snapshot", "/profile/abc"]).unwrap();
        assert!(!cli.metrics);
    }
}
