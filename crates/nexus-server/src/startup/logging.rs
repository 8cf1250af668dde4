//! File-based logging with per-component files.
//!
//! Components write to separate log files with daily rotation:
//!
//! | Log File      | Component                       | Target Prefixes     |
//! |---------------|---------------------------------|---------------------|
//! | nexus.log     | Root logger (all components)    | (all)               |
//! | topology.log  | Replica set topology monitoring | nexus_core          |
//! | storage.log   | Storage gateway and replica set | nexus_persistence   |
//! | ledger.log    | Ledger operations and audits    | nexus_ledger        |
//!
//! Log files are stored in `~/nexus/logs` by default.
//! Override with `NEXUS_LOG_DIR` environment variable or `logs.path` config.

use std::path::PathBuf;

use nexus_core::Configuration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub const ROOT_LOG_FILE: &str = "nexus.log";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

/// Events are routed by their `tracing` target (module path). The root
/// `nexus.log` file always captures every event.
const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "topology.log",
        targets: &["nexus_core"],
    },
    ComponentLogDef {
        file_name: "storage.log",
        targets: &["nexus_persistence"],
    },
    ComponentLogDef {
        file_name: "ledger.log",
        targets: &["nexus_ledger", "nexus_server::api::ledger"],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

impl LogRotation {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

/// Logging configuration for the entire application.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base log directory (default: `~/nexus/logs`)
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{}/nexus/logs", home))
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: true,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let log_dir = std::env::var("NEXUS_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_log_dir());

        let console_output = std::env::var("NEXUS_LOG_CONSOLE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        let file_logging = std::env::var("NEXUS_LOG_FILE")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(true);

        let console_level = std::env::var("NEXUS_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        let file_level = std::env::var("NEXUS_LOG_FILE_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(console_level);

        let rotation = std::env::var("NEXUS_LOG_ROTATION")
            .map(|v| LogRotation::parse(&v))
            .unwrap_or(LogRotation::Daily);

        Self {
            log_dir,
            console_output,
            console_level,
            file_logging,
            file_level,
            rotation,
        }
    }

    /// Create from application configuration.
    pub fn from_configuration(configuration: &Configuration) -> Self {
        let log_dir = PathBuf::from(configuration.log_dir());
        let level = configuration.log_level().parse().unwrap_or(Level::INFO);

        Self {
            log_dir,
            console_output: configuration.log_console_enabled(),
            console_level: level,
            file_logging: configuration.log_file_enabled(),
            file_level: level,
            rotation: LogRotation::Daily,
        }
    }
}

/// Keeps the file appender workers alive. When dropped, buffered log output
/// is flushed.
pub struct LoggingGuard {
    file_guards: Vec<WorkerGuard>,
}

impl LoggingGuard {
    pub fn file_count(&self) -> usize {
        self.file_guards.len()
    }
}

/// Initialize console output plus the root and component log files.
///
/// `RUST_LOG` overrides the level of the console and root file layers.
/// Component files capture everything from their targets.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, Box<dyn std::error::Error>> {
    let (layers, guards) = build_layers(config)?;

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            "File logging initialized: {} (root) + {} component log files",
            ROOT_LOG_FILE,
            COMPONENT_LOGS.len()
        );
    }

    Ok(LoggingGuard {
        file_guards: guards,
    })
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn build_layers(
    config: &LoggingConfig,
) -> Result<(Vec<BoxedLayer>, Vec<WorkerGuard>), Box<dyn std::error::Error>> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let mut targets = Targets::new();
            for target in component.targets {
                targets = targets.with_target(*target, LevelFilter::TRACE);
            }

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(targets);
            layers.push(Box::new(layer));
        }
    }

    Ok((layers, guards))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert!(config.console_output);
        assert!(config.file_logging);
        assert_eq!(config.console_level, Level::INFO);
        assert!(config.log_dir.ends_with("nexus/logs"));
    }

    #[test]
    fn test_logging_config_from_configuration() {
        let config = config::Config::builder()
            .set_override("logs.path", "/tmp/nexus-test-logs")
            .unwrap()
            .set_override("logs.level", "debug")
            .unwrap()
            .set_override("logs.console", false)
            .unwrap()
            .build()
            .unwrap();
        let logging = LoggingConfig::from_configuration(&Configuration::from_config(config));

        assert_eq!(logging.log_dir, PathBuf::from("/tmp/nexus-test-logs"));
        assert!(!logging.console_output);
        assert_eq!(logging.file_level, Level::DEBUG);
    }

    #[test]
    fn test_rotation_parse() {
        assert_eq!(LogRotation::parse("HOURLY"), LogRotation::Hourly);
        assert_eq!(LogRotation::parse("never"), LogRotation::Never);
        assert_eq!(LogRotation::parse("weekly"), LogRotation::Daily);
        assert!(matches!(
            Rotation::from(LogRotation::Hourly),
            Rotation::HOURLY
        ));
    }

    #[test]
    fn test_component_targets() {
        let targets: Vec<&str> = COMPONENT_LOGS
            .iter()
            .flat_map(|c| c.targets.iter().copied())
            .collect();
        assert!(targets.contains(&"nexus_core"));
        assert!(targets.contains(&"nexus_persistence"));
        assert!(targets.contains(&"nexus_ledger"));
        for component in COMPONENT_LOGS {
            assert!(component.file_name.ends_with(".log"));
        }
    }

    #[test]
    fn test_file_layers_create_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LoggingConfig {
            log_dir: log_dir.clone(),
            console_output: false,
            file_logging: true,
            ..Default::default()
        };

        let (layers, guards) = build_layers(&config).unwrap();

        assert!(log_dir.is_dir());
        assert_eq!(guards.len(), 1 + COMPONENT_LOGS.len());
        assert_eq!(layers.len(), 1 + COMPONENT_LOGS.len());
    }
}
