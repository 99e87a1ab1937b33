use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "km")]
#[command(about = "Transparent observability wrapper for MCP servers", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    #[command(about = "Run an MCP server under the monitor")]
    Monitor {
        #[arg(long)]
        api_endpoint: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        /// Maximum accepted wire line length, bytes.
        #[arg(long)]
        buffer_size: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Seconds between time-based flushes; 0 disables.
        #[arg(long)]
        flush_interval: Option<u64>,
        #[arg(long)]
        log_level: Option<String>,
        #[arg(long, default_value_t = false)]
        debug: bool,
        /// Replay a capture file instead of spawning a child.
        #[arg(long, value_name = "FILE")]
        replay: Option<PathBuf>,
        /// The MCP server command; everything after `--` is passed through
        /// unchanged.
        #[arg(
            value_name = "COMMAND",
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        child: Vec<String>,
    },
    #[command(about = "Inspect or clear cached credentials")]
    Auth {
        #[command(subcommand)]
        action: AuthCommands,
    },
    #[command(about = "Print version information")]
    Version,
}

#[derive(Subcommand)]
pub(crate) enum AuthCommands {
    #[command(about = "Show cached token scopes and expiry")]
    Status,
    #[command(about = "Remove all cached tokens")]
    Clear,
}
