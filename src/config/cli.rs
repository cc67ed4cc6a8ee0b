use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::domain::types::DatasetKind;

/// Command-line arguments for the leadcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "leadcache",
    version,
    about = "Stale-while-revalidate cache of CRM leads"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "LEADCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve cached datasets over HTTP.
    Serve(Box<ServeArgs>),
    /// Rebuild datasets once, write their snapshots and exit.
    Refresh(RefreshArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RefreshArgs {
    /// Only rebuild this dataset (leads|closed); all enabled datasets otherwise.
    #[arg(long, value_name = "NAME")]
    pub dataset: Option<DatasetKind>,

    #[command(flatten)]
    pub overrides: CommonOverrides,
}

/// Overrides shared by every command.
#[derive(Debug, Args, Default, Clone)]
pub struct CommonOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the CRM base URL.
    #[arg(long = "upstream-base-url", value_name = "URL")]
    pub upstream_base_url: Option<String>,

    /// Override the directory holding snapshot files.
    #[arg(long = "snapshot-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub common: CommonOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the scheduled refresh period; 0 disables it.
    #[arg(long = "refresh-interval-seconds", value_name = "SECONDS")]
    pub refresh_interval_seconds: Option<u64>,
}
