//! aggrepo - inspect and recover durable aggregation repositories.

mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Aggregation repository command-line interface.
#[derive(Parser)]
#[command(name = "aggrepo")]
#[command(about = "Inspect, confirm and recover exchanges in a durable aggregation repository")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (JSON). Defaults to ~/.aggrepo/config.json
    #[arg(long, global = true, env = "AGGREPO_CONFIG")]
    config: Option<PathBuf>,

    /// Durable store file (overrides persistent_file_name)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Repository name (overrides repository_name)
    #[arg(long, global = true)]
    repository: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List live correlation keys
    Keys,
    /// List exchange ids awaiting confirmation
    Completed,
    /// Show the live snapshot for a correlation key
    Get { key: String },
    /// Show a completed snapshot
    Recover { exchange_id: String },
    /// Confirm a completed exchange, dropping it
    Confirm { exchange_id: String },
    /// Run one recovery cycle; redeliveries are printed as JSON lines
    Scan,
    /// Run the recovery scanner until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init_logging(&cli.log_level, cli.json_logs)?;

    let config = commands::load_config(
        cli.config.as_deref(),
        cli.store.as_deref(),
        cli.repository.as_deref(),
    )?;
    let repo = commands::open_repository(config)?;
    let mut stdout = std::io::stdout().lock();

    match cli.command {
        Commands::Keys => commands::keys(&repo, &mut stdout)?,
        Commands::Completed => commands::completed(&repo, &mut stdout)?,
        Commands::Get { key } => commands::get(&repo, &key, &mut stdout)?,
        Commands::Recover { exchange_id } => commands::recover(&repo, &exchange_id, &mut stdout)?,
        Commands::Confirm { exchange_id } => commands::confirm(&repo, &exchange_id, &mut stdout)?,
        Commands::Scan => {
            drop(stdout);
            commands::scan(repo)?
        }
        Commands::Watch => {
            drop(stdout);
            commands::watch(repo).await?
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "aggrepo",
            "get",
            "acct-7",
            "--store",
            "/tmp/orders.db",
            "--repository",
            "orders",
            "--json-logs",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Get { ref key } if key == "acct-7"));
        assert_eq!(cli.repository.as_deref(), Some("orders"));
        assert!(cli.json_logs);
    }
}
