/// Classic offset/hex/ascii dump for tracing raw frames.
pub fn hexdump(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    const WIDTH: usize = 16;
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(WIDTH).enumerate() {
        let _ = write!(out, "{:08x}  ", i * WIDTH);
        for (j, byte) in chunk.iter().enumerate() {
            if j == WIDTH / 2 {
                out.push(' ');
            }
            let _ = write!(out, "{byte:02x} ");
        }
        for _ in chunk.len()..WIDTH {
            out.push_str("   ");
        }
        out.push(' ');
        out.extend(chunk.iter().map(|&byte| {
            if (0x20..=0x7e).contains(&byte) {
                byte as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Full `EnvFilter` directives; replaces the level-derived filter.
        pub filter: Option<String>,
        /// Lets rustls and tokio internals log at trace too.
        pub trace_deps: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }
        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let (directives, throttled_deps) = filter_directives(config);
        let env_filter = EnvFilter::try_new(&directives)
            .map_err(|err| InitError::Configure(format!("log filter '{directives}': {err}")))?;

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_level(true)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled_deps {
            tracing::debug!(
                target = "sandpolis::telemetry",
                "dependency traces limited to info; pass --trace-deps or --log-filter to override"
            );
        }
        Ok(())
    }

    /// Filter directives for `config`, and whether dependency traces were
    /// held back.
    pub(crate) fn filter_directives(config: &LogConfig) -> (String, bool) {
        match &config.filter {
            Some(filter) => (filter.clone(), false),
            None => default_filter_for(config.level.to_filter(), config.trace_deps),
        }
    }

    const TRACE_DEP_TARGETS: &[&str] = &["rustls", "tokio_rustls", "mio", "tokio"];

    pub(crate) fn default_filter_for(level: LevelFilter, trace_deps: bool) -> (String, bool) {
        let base = match level {
            LevelFilter::TRACE => "info,sandpolis_client_core=trace,sandpolis=trace,state_tree=trace",
            LevelFilter::DEBUG => "info,sandpolis_client_core=debug,sandpolis=debug,state_tree=debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        if level == LevelFilter::TRACE && !trace_deps {
            (throttle_dependency_traces(base), true)
        } else {
            (base.to_owned(), false)
        }
    }

    fn throttle_dependency_traces(base: &str) -> String {
        let mut filter = base.to_owned();
        for target in TRACE_DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=info");
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::logging::{default_filter_for, filter_directives, LogConfig, LogLevel};
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test_timeout::timeout]
    fn hexdump_pads_short_rows() {
        let dump = hexdump(b"sandpolis\x00");
        assert_eq!(
            dump,
            "00000000  73 61 6e 64 70 6f 6c 69  73 00                    sandpolis.\n"
        );
    }

    #[test_timeout::timeout]
    fn trace_filter_throttles_dependencies() {
        let (filter, throttled) = default_filter_for(LogLevel::Trace.to_filter(), false);
        assert!(throttled);
        assert!(filter.contains("sandpolis_client_core=trace"));
        assert!(filter.ends_with("tokio=info"));

        let (filter, throttled) = default_filter_for(LogLevel::Trace.to_filter(), true);
        assert!(!throttled);
        assert!(!filter.contains("tokio=info"));

        let (filter, throttled) = default_filter_for(LevelFilter::WARN, false);
        assert!(!throttled);
        assert_eq!(filter, "warn");
    }

    #[test_timeout::timeout]
    fn explicit_filter_replaces_the_level() {
        let config = LogConfig {
            level: LogLevel::Trace,
            filter: Some("state_tree=debug".into()),
            ..LogConfig::default()
        };
        assert_eq!(filter_directives(&config), ("state_tree=debug".to_string(), false));

        let config = LogConfig {
            level: LogLevel::Info,
            ..LogConfig::default()
        };
        assert_eq!(filter_directives(&config), ("info".to_string(), false));
    }
}
