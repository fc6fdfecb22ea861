use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "mcpmux", version, about = "Aggregating MCP proxy: find/run over many backend tool servers")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/mcpmux.yaml")]
    pub config: PathBuf,
}

/// `~/.mcpmux`, used as the default for every on-disk artifact (profile, caches, logs)
/// when `base_dir` is not set in the config file.
pub fn mcpmux_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".mcpmux")
}
