//! rwmd - RimWorld Workshop Mod Downloader
//!
//! Command-line front end: downloads Workshop items through SteamCMD into
//! the active mods folder, with version and dependency checks on the way.

mod terminal;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use rwmd::config::{ConfigProvider, SettingsStore};
use rwmd::orchestrator::DownloadOrchestrator;
use rwmd::processor::ModProcessor;
use rwmd::queue::{AbandonReason, QueueOutcome, RequestQueue};
use rwmd::steamcmd::SteamCmd;
use rwmd::types::{is_workshop_id, DownloadItem, DownloadResult, ItemStatus};
use rwmd::workshop::{MetadataSource, WorkshopScraper};
use terminal::{TerminalPrompt, TerminalReporter};

#[derive(Parser)]
#[command(name = "rwmd")]
#[command(version)]
#[command(about = "RimWorld Workshop mod downloader - SteamCMD in, mods folder out")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (RUST_LOG overrides this)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, env = "RWMD_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Settings file (default: ~/.config/rwmd/settings.json)
    #[arg(short, long, global = true, env = "RWMD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check and download Workshop items one at a time
    Download {
        /// Workshop item IDs
        #[arg(required = true, value_parser = parse_item_id)]
        ids: Vec<String>,
    },

    /// Check items, add them to the pending batch, then download the batch
    Queue {
        /// Workshop item IDs
        #[arg(required = true, value_parser = parse_item_id)]
        ids: Vec<String>,
    },

    /// Show versions and dependencies scraped from a Workshop page
    Info {
        /// Workshop item ID
        #[arg(value_parser = parse_item_id)]
        id: String,
    },

    /// Validate a mod folder (About/About.xml)
    Validate {
        /// Path to the mod folder
        path: PathBuf,
    },

    /// Show the effective settings
    Config,
}

/// Workshop IDs are numeric; anything else never reaches the pipeline
fn parse_item_id(s: &str) -> Result<String, String> {
    let id = s.trim();
    if is_workshop_id(id) {
        Ok(id.to_string())
    } else {
        Err(format!("'{}' is not a Workshop item ID (digits only)", s))
    }
}

/// Install the stderr subscriber plus an optional file layer.
///
/// The returned guard flushes the file writer and must outlive `main`'s work.
fn init_logging(
    verbose: bool,
    log_file: Option<&PathBuf>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if verbose { "rwmd=debug" } else { "rwmd=info" })
        })
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(stderr_layer).init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .context("Log file path has no file name")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(&dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_ref())?;

    let store = match &cli.config {
        Some(path) => SettingsStore::open(path.clone()),
        None => SettingsStore::open_default().context("Failed to locate settings")?,
    };
    let store = Arc::new(store);

    match cli.command {
        Commands::Download { ids } => {
            let queue = build_queue(store)?;
            let mut results = Vec::new();
            for id in ids {
                match queue.download_now(DownloadItem::from_id(id.clone())).await {
                    QueueOutcome::Submitted(batch) => results.extend(batch),
                    QueueOutcome::Abandoned(reason) => print_abandoned(&id, reason),
                    QueueOutcome::PendingKept { pending } => {
                        println!("{} mods left pending", pending)
                    }
                    QueueOutcome::Queued { .. } => {}
                }
            }
            finish(&results)?;
        }

        Commands::Queue { ids } => {
            let queue = build_queue(store)?;
            for id in ids {
                match queue.add_to_queue(DownloadItem::from_id(id.clone())).await {
                    QueueOutcome::Queued { added, pending } => {
                        println!("Queued {} ({} pending)", added.join(", "), pending)
                    }
                    QueueOutcome::Abandoned(reason) => print_abandoned(&id, reason),
                    _ => {}
                }
            }
            if queue.is_empty() {
                println!("Nothing to download");
                return Ok(());
            }
            match queue.offer_pending().await {
                QueueOutcome::Submitted(results) => finish(&results)?,
                _ => println!("Download postponed, {} mods pending", queue.len()),
            }
        }

        Commands::Info { id } => {
            let scraper = WorkshopScraper::new().context("Failed to create HTTP client")?;
            let info = scraper
                .scrape_version_info(&id)
                .await
                .with_context(|| format!("Failed to fetch Workshop page for {}", id))?;

            println!("Mod: {} ({})", info.mod_name, id);
            if info.supported_versions.is_empty() {
                println!("Versions: (none declared)");
            } else {
                println!("Versions: {}", info.supported_versions.join(", "));
            }
            if let Some(game) = store.game_version() {
                if info.excludes_version(&game) {
                    println!("Warning: game version {} is not supported", game);
                }
            }
            if info.dependencies.is_empty() {
                println!("Dependencies: none");
            } else {
                println!("Dependencies:");
                for dep in &info.dependencies {
                    println!("  {} ({})", dep.name, dep.id);
                }
            }
        }

        Commands::Validate { path } => {
            let processor = ModProcessor::new(store);
            let item_id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let result = processor.validate_item(&item_id, &path).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.valid {
                bail!("{} is not a valid mod folder", path.display());
            }
        }

        Commands::Config => {
            match store.path() {
                Some(path) => println!("Settings file: {}", path.display()),
                None => println!("Settings file: (in memory)"),
            }
            println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
        }
    }

    Ok(())
}

/// Wire the pipeline: SteamCMD and processor under the orchestrator, the
/// orchestrator under the request queue. Ctrl+C cancels the active item.
fn build_queue(store: Arc<SettingsStore>) -> Result<RequestQueue> {
    let config: Arc<dyn ConfigProvider> = store;

    let tool = SteamCmd::new(Arc::clone(&config));
    if let Err(e) = tool.validate() {
        warn!("{}", e);
    }
    let processor = Arc::new(ModProcessor::new(Arc::clone(&config)));

    let reporter = Arc::new(TerminalReporter::new());
    let mut orchestrator = DownloadOrchestrator::new(Arc::new(tool), processor);
    orchestrator.set_event_callback(reporter.callback());
    let orchestrator = Arc::new(orchestrator);

    let watcher = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if watcher.cancel() {
                info!("Cancelling current download...");
            } else {
                std::process::exit(130);
            }
        }
    });

    let scraper = WorkshopScraper::new().context("Failed to create HTTP client")?;
    Ok(RequestQueue::new(
        config,
        Arc::new(scraper),
        Arc::new(TerminalPrompt),
        orchestrator,
    ))
}

fn print_abandoned(id: &str, reason: AbandonReason) {
    match reason {
        AbandonReason::VersionSkipped => {
            println!("Skipped {}: game version not supported", id)
        }
        AbandonReason::UserSkipped => println!("Skipped {}", id),
        AbandonReason::UserCancelled => println!("Cancelled {}", id),
    }
}

/// Print a summary; an error if anything failed
fn finish(results: &[DownloadResult]) -> Result<()> {
    if results.is_empty() {
        return Ok(());
    }

    let completed = results.iter().filter(|r| r.success()).count();
    let cancelled = results.iter().filter(|r| r.is_cancelled()).count();
    let failed: Vec<&DownloadResult> = results
        .iter()
        .filter(|r| r.status == ItemStatus::Error)
        .collect();

    println!();
    println!(
        "Done: {} installed, {} cancelled, {} failed",
        completed,
        cancelled,
        failed.len()
    );
    for result in results.iter().filter(|r| r.success()) {
        if let Some(path) = &result.local_path {
            println!("  {} -> {}", result.name, path.display());
        }
    }
    for result in &failed {
        if let Some(error) = &result.error {
            println!("  {} ({}): {}", result.name, result.item_id, error);
        }
    }

    if !failed.is_empty() {
        bail!("{} of {} downloads failed", failed.len(), results.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_ids_must_be_numeric() {
        assert_eq!(parse_item_id("2009463077").unwrap(), "2009463077");
        assert_eq!(parse_item_id(" 42 ").unwrap(), "42");
        assert!(parse_item_id("../x").is_err());
        assert!(parse_item_id("").is_err());

        assert!(Cli::try_parse_from(["rwmd", "download", "../Saves"]).is_err());
        assert!(Cli::try_parse_from(["rwmd", "info", "abc"]).is_err());
        assert!(Cli::try_parse_from(["rwmd", "queue", "1", "2"]).is_ok());
    }
}
