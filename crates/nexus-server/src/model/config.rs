//! Configuration loading for the Nexus server
//!
//! Sources, lowest precedence first: `conf/application.yml`, `NEXUS_*`
//! environment variables (`__` separates nesting, e.g.
//! `NEXUS_STORE__MAX_POOL_SIZE`), then command line flags.

use clap::Parser;
use config::{Config, Environment, File};
use nexus_common::NexusError;
use nexus_core::Configuration;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "nexus-server", about = "Banco Nexus replicated ledger server")]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config_file: String,
    #[arg(short = 'p', long = "port", env = "NEXUS_PORT")]
    pub port: Option<u16>,
    /// Replica set members, comma separated
    #[arg(long = "nodes", env = "NEXUS_NODES")]
    pub nodes: Option<String>,
    /// Seed the sample data on startup
    #[arg(long = "seed")]
    pub seed: Option<bool>,
}

/// Build the configuration from the file, the environment and `cli`
pub fn load_configuration(cli: &Cli) -> Result<Configuration, NexusError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(&cli.config_file).required(false))
        .add_source(
            Environment::with_prefix("nexus")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let override_err = |e: config::ConfigError| NexusError::ConfigError(e.to_string());
    if let Some(port) = cli.port {
        builder = builder
            .set_override("server.port", port as i64)
            .map_err(override_err)?;
    }
    if let Some(nodes) = &cli.nodes {
        builder = builder
            .set_override("store.nodes", nodes.as_str())
            .map_err(override_err)?;
    }
    if let Some(seed) = cli.seed {
        builder = builder
            .set_override("bootstrap.seed", seed)
            .map_err(override_err)?;
    }

    let config = builder
        .build()
        .map_err(|e| NexusError::ConfigError(e.to_string()))?;
    Ok(Configuration::from_config(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_then_cli_override() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 4000\nstore:\n  nodes: \"x:1,y:2,z:3\"\n  max_pool_size: 20\n"
        )
        .unwrap();

        let cli = Cli {
            config_file: file.path().to_string_lossy().to_string(),
            port: Some(5000),
            nodes: None,
            seed: Some(false),
        };
        let configuration = load_configuration(&cli).unwrap();

        assert_eq!(configuration.server_port(), 5000);
        assert_eq!(configuration.max_pool_size(), 20);
        assert_eq!(configuration.store_nodes().len(), 3);
        assert!(!configuration.seed_on_startup());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cli = Cli {
            config_file: "does/not/exist.yml".to_string(),
            ..Default::default()
        };
        let configuration = load_configuration(&cli).unwrap();

        assert_eq!(configuration.replica_set_name(), "rsBanco");
        assert_eq!(configuration.wtimeout_ms(), 10000);
    }
}
