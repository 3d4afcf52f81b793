//! Subcommand implementations.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aggregation_repository::{
    AggregationRepository, AggregationService, DeadLetterChannel, JsonLinesRedeliverer,
    JsonlDeadLetterFile, RecoveryTask, RepositoryConfig,
};
use anyhow::{anyhow, bail, Context};
use tracing::info;

/// Directory under the home directory holding the default config.
const CONFIG_DIR: &str = ".aggrepo";
const CONFIG_FILE: &str = "config.json";

/// `~/.aggrepo/config.json`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Loads defaults, the config file, `AGGREPO_*` variables, then the flags.
///
/// An explicitly given config file must exist; the default one is optional.
pub fn load_config(
    explicit: Option<&Path>,
    store: Option<&Path>,
    repository: Option<&str>,
) -> anyhow::Result<RepositoryConfig> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("config file {} does not exist", path.display());
        }
    }
    let path = explicit.map(Path::to_path_buf).or_else(default_config_path);
    let mut config = RepositoryConfig::load(path.as_deref())
        .with_context(|| format!("failed to load configuration from {:?}", path))?;

    if let Some(store) = store {
        config.persistent_file_name = Some(store.to_path_buf());
    }
    if let Some(name) = repository {
        config.repository_name = name.to_string();
    }
    Ok(config)
}

pub fn open_repository(config: RepositoryConfig) -> anyhow::Result<AggregationRepository> {
    if config.persistent_file_name.is_none() {
        bail!("no store configured: pass --store or set persistent_file_name");
    }
    let name = config.repository_name.clone();
    AggregationRepository::open(config)
        .with_context(|| format!("failed to open repository {:?}", name))
}

/// Resolves the configured dead-letter destination. Only `file:<path>`
/// destinations can be served from the command line.
pub fn dead_letter_for(config: &RepositoryConfig) -> anyhow::Result<Arc<dyn DeadLetterChannel>> {
    let destination = config
        .dead_letter_uri
        .as_deref()
        .ok_or_else(|| anyhow!("dead_letter_uri is not configured"))?;
    let file = JsonlDeadLetterFile::for_destination(destination)
        .ok_or_else(|| {
            anyhow!(
                "unsupported dead letter destination {:?}, expected file:<path>",
                destination
            )
        })?
        .with_context(|| format!("failed to open dead letter destination {:?}", destination))?;
    Ok(Arc::new(file))
}

pub fn keys(repo: &AggregationRepository, out: &mut impl Write) -> anyhow::Result<()> {
    for key in repo.keys()? {
        writeln!(out, "{}", key)?;
    }
    Ok(())
}

pub fn completed(repo: &AggregationRepository, out: &mut impl Write) -> anyhow::Result<()> {
    for id in repo.completed_ids() {
        writeln!(out, "{}", id?)?;
    }
    Ok(())
}

pub fn get(repo: &AggregationRepository, key: &str, out: &mut impl Write) -> anyhow::Result<()> {
    let exchange = repo
        .get(key)?
        .ok_or_else(|| anyhow!("no live entry for key {:?}", key))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&exchange)?)?;
    Ok(())
}

pub fn recover(
    repo: &AggregationRepository,
    exchange_id: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    if !repo.config().use_recovery {
        bail!("recovery is disabled for repository {:?}", repo.name());
    }
    let exchange = repo
        .recover(exchange_id)?
        .ok_or_else(|| anyhow!("no completed entry for exchange {:?}", exchange_id))?;
    writeln!(out, "{}", serde_json::to_string_pretty(&exchange)?)?;
    Ok(())
}

pub fn confirm(
    repo: &AggregationRepository,
    exchange_id: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    if repo.confirm(exchange_id)? {
        writeln!(out, "confirmed {}", exchange_id)?;
    } else {
        writeln!(out, "nothing to confirm for {}", exchange_id)?;
    }
    Ok(())
}

/// One recovery cycle. Redeliveries go to stdout as JSON lines, the cycle
/// report to stderr.
pub fn scan(repo: AggregationRepository) -> anyhow::Result<()> {
    let dead_letter = dead_letter_for(repo.config())?;
    let redeliverer = Arc::new(JsonLinesRedeliverer::new(std::io::stdout()));
    let task = RecoveryTask::new(Arc::new(repo), redeliverer, dead_letter)?;

    let report = task.run_cycle();
    eprintln!("{}", serde_json::to_string(&report)?);
    if report.failed > 0 {
        bail!("{} exchange(s) could not be recovered", report.failed);
    }
    Ok(())
}

/// Runs the periodic scanner until Ctrl-C, then shuts down in order.
pub async fn watch(repo: AggregationRepository) -> anyhow::Result<()> {
    let dead_letter = dead_letter_for(repo.config())?;
    let redeliverer = Arc::new(JsonLinesRedeliverer::new(std::io::stdout()));
    let service = AggregationService::with_repository(Arc::new(repo), redeliverer, dead_letter)?;

    info!(repository = %service.repository().name(), "watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    tokio::task::spawn_blocking(move || service.shutdown())
        .await
        .context("shutdown task failed")??;
    Ok(())
}
