//! Bulwark CLI entry point.

use clap::Parser;

use bulwark::cli::{handle_error, run, Cli};
use bulwark::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;

    let config = cli
        .load_config()
        .unwrap_or_else(|err| handle_error(err, json_mode));
    let _logger = LoggerImpl::init(&LogConfig::from(&config.logging))
        .unwrap_or_else(|err| handle_error(err, json_mode));

    if let Err(err) = run(cli, &config).await {
        handle_error(err, json_mode);
    }
}
