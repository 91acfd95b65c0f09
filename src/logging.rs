/*!
 * Logging and tracing initialization
 */

use std::fs::File;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::error::{Result, TransferError};

type OutputLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Where log lines go: compact text on stderr, keeping stdout free for
/// progress, or JSON lines in a file
#[derive(Debug)]
enum Destination {
    Stderr,
    File(File),
}

impl Destination {
    fn open(config: &LoggingConfig) -> Result<Self> {
        match &config.log_file {
            Some(path) => File::create(path).map(Destination::File).map_err(|e| {
                TransferError::Config(format!("cannot create log file {}: {}", path.display(), e))
            }),
            None => Ok(Destination::Stderr),
        }
    }

    fn layer(self) -> OutputLayer {
        match self {
            Destination::Stderr => fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NONE)
                .compact()
                .boxed(),
            Destination::File(file) => fmt::layer()
                .with_writer(file)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_ansi(false)
                .json()
                .boxed(),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("cumulus={}", effective_level(config))))
        .map_err(|e| TransferError::Config(format!("invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(Destination::open(config)?.layer())
        .with(filter)
        .try_init()
        .map_err(|e| TransferError::Config(format!("logging already initialized: {}", e)))
}

fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cumulus=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok(); // Ignore error if already initialized
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_verbose_overrides_level() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            log_file: None,
            verbose: true,
        };
        assert_eq!(effective_level(&config), Level::DEBUG);
    }

    #[test]
    fn test_level_mapping() {
        let config = LoggingConfig {
            level: LogLevel::Trace,
            ..Default::default()
        };
        assert_eq!(effective_level(&config), Level::TRACE);
        assert_eq!(
            effective_level(&LoggingConfig::default()),
            Level::INFO
        );
    }

    #[test]
    fn test_log_file_destination_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cumulus.log");
        let config = LoggingConfig {
            log_file: Some(path.clone()),
            ..Default::default()
        };
        assert!(matches!(Destination::open(&config).unwrap(), Destination::File(_)));
        assert!(path.exists());
        assert!(matches!(
            Destination::open(&LoggingConfig::default()).unwrap(),
            Destination::Stderr
        ));
    }

    #[test]
    fn test_unwritable_log_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_file: Some(dir.path().join("missing").join("cumulus.log")),
            ..Default::default()
        };
        assert!(matches!(
            Destination::open(&config),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("test logging initialized twice");
    }
}
