//! Command-line interface for the Armada node binary.
//!
//! Parses the arguments that select the configuration file and override
//! individual settings from it, using the `clap` builder API.

use clap::{Arg, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
///
/// Everything except the config path is an optional override applied on
/// top of the loaded configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the node id
    pub node_id: Option<String>,
    /// Optional override for the cluster bind address
    pub bind_address: Option<String>,
    /// Optional override for the log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses command line arguments using clap.
    pub fn parse() -> Self {
        let matches = Command::new("Armada Node")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Clustered orchestration node with peer sync and service scheduling")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("armada.toml"),
            )
            .arg(
                Arg::new("node-id")
                    .short('n')
                    .long("node-id")
                    .value_name("ID")
                    .help("Node id this instance joins the cluster as"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Cluster bind address (e.g., 0.0.0.0:14920)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("config has a default value"),
            ),
            node_id: matches.get_one::<String>("node-id").cloned(),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
