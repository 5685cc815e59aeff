//! Operator command line over the persisted runtime state.

pub mod commands;
pub mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::domain::models::config::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Parser, Debug)]
#[command(name = "bulwark", version, about = "Inspect and maintain a Bulwark event runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file to use instead of .bulwark/config.yaml
    #[arg(short, long, global = true, env = "BULWARK_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the effective configuration
    Config(commands::config::ConfigArgs),

    /// Inspect persisted critical events awaiting acknowledgement
    Pending(commands::pending::PendingArgs),

    /// Manage dead letter queue entries
    Dlq(commands::dlq::DlqArgs),
}

impl Cli {
    /// Load configuration from `--config` or the project hierarchy.
    pub fn load_config(&self) -> Result<Config> {
        match self.config {
            Some(ref path) => ConfigLoader::load_from_file(path),
            None => ConfigLoader::load(),
        }
    }
}

/// Run the parsed command against an already loaded configuration.
pub async fn run(cli: Cli, config: &Config) -> Result<()> {
    match cli.command {
        Commands::Config(args) => commands::config::execute(args, config, cli.json),
        Commands::Pending(args) => commands::pending::execute(args, config, cli.json).await,
        Commands::Dlq(args) => commands::dlq::execute(args, config, cli.json).await,
    }
}

/// Print an error in the selected output mode and exit non-zero.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = serde_json::json!({
            "error": err.to_string(),
            "causes": err.chain().skip(1).map(ToString::to_string).collect::<Vec<_>>(),
        });
        eprintln!("{body}");
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_dlq_list() {
        let cli = Cli::try_parse_from([
            "bulwark", "--json", "dlq", "list", "--type", "tool.", "--limit", "5",
        ])
        .unwrap();
        assert!(cli.json);
        let Commands::Dlq(args) = cli.command else {
            panic!("expected dlq command");
        };
        let commands::dlq::DlqCommands::List {
            event_type, limit, ..
        } = args.command
        else {
            panic!("expected list");
        };
        assert_eq!(event_type.as_deref(), Some("tool."));
        assert_eq!(limit, 5);
    }
}
