//! Terminal front end pieces: stdin prompts and progress bars

use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rwmd::orchestrator::{EventCallback, PipelineEvent};
use rwmd::queue::{DecisionPrompt, MismatchChoice, MismatchDecision, VersionMismatch};
use rwmd::types::{Dependency, DownloadItem, DownloadProgress, PendingQueueEntry, ProgressStage};

/// Read one trimmed line from stdin. `None` on EOF or read error.
async fn ask(question: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        print!("{}", question);
        let _ = io::stdout().flush();
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

/// Decision prompt on stdin/stdout
pub struct TerminalPrompt;

#[async_trait]
impl DecisionPrompt for TerminalPrompt {
    async fn resolve_version_mismatch(&self, mismatch: &VersionMismatch) -> Option<MismatchDecision> {
        println!();
        println!("Version mismatch: {} ({})", mismatch.item_name, mismatch.item_id);
        println!("  Mod supports: {}", mismatch.mod_versions.join(", "));
        println!("  Game version: {}", mismatch.game_version);

        let choice = match ask("[f]orce download, [s]kip, anything else cancels: ".to_string())
            .await?
            .to_ascii_lowercase()
            .as_str()
        {
            "f" | "force" => MismatchChoice::Force,
            "s" | "skip" => MismatchChoice::Skip,
            _ => return None,
        };

        let remember = ask("Remember this choice? [y/N]: ".to_string())
            .await
            .is_some_and(|a| a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes"));

        Some(MismatchDecision { choice, remember })
    }

    async fn select_dependencies(
        &self,
        item: &DownloadItem,
        dependencies: &[Dependency],
    ) -> Option<Vec<String>> {
        println!();
        println!("{} requires:", item.name);
        for (i, dep) in dependencies.iter().enumerate() {
            println!("  {:>2}. {} ({})", i + 1, dep.name, dep.id);
        }

        let answer = ask(
            "Include [a]ll (default), [n]one, numbers like 1,3, or [c]ancel: ".to_string(),
        )
        .await?;

        match answer.to_ascii_lowercase().as_str() {
            "" | "a" | "all" => Some(dependencies.iter().map(|d| d.id.clone()).collect()),
            "n" | "none" => Some(Vec::new()),
            "c" | "cancel" => None,
            list => Some(
                list.split(|c: char| c == ',' || c.is_whitespace())
                    .filter_map(|n| n.parse::<usize>().ok())
                    .filter_map(|n| n.checked_sub(1).and_then(|i| dependencies.get(i)))
                    .map(|d| d.id.clone())
                    .collect(),
            ),
        }
    }

    async fn confirm_pending_batch(&self, pending: &[PendingQueueEntry]) -> bool {
        println!();
        println!("Download queue ({} mods):", pending.len());
        for entry in pending {
            let kind = if entry.is_collection { "Collection" } else { "Mod" };
            println!("  {} ({} {})", entry.display_name(), kind, entry.id);
        }

        ask(format!("Download these {} mods now? [Y/n]: ", pending.len()))
            .await
            .is_some_and(|a| a.is_empty() || a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes"))
    }
}

/// One progress bar per item, created on first sight of the item
#[derive(Default)]
pub struct TerminalReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TerminalReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    pub fn callback(self: &Arc<Self>) -> EventCallback {
        let reporter = Arc::clone(self);
        Arc::new(move |event| reporter.handle(event))
    }

    fn bar(&self, item_id: &str, name: Option<&str>) -> ProgressBar {
        let mut bars = self.bars.lock().unwrap_or_else(PoisonError::into_inner);
        bars.entry(item_id.to_string())
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new(100));
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} {prefix:30!} [{bar:30.cyan/blue}] {pos:>3}% | {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=>-"),
                );
                pb.set_prefix(name.unwrap_or(item_id).to_string());
                pb.enable_steady_tick(Duration::from_millis(120));
                pb
            })
            .clone()
    }

    fn handle(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::Started { item_id, name } => {
                self.bar(&item_id, Some(&name)).set_message("queued");
            }
            PipelineEvent::Batch { index, total, name } => {
                let _ = self.multi.println(format!("[{}/{}] {}", index, total, name));
            }
            PipelineEvent::Progress { item_id, progress } => {
                apply_progress(&self.bar(&item_id, None), &progress);
            }
            PipelineEvent::StateChanged { .. } => {}
            PipelineEvent::Completed(result) => {
                let pb = self.bar(&result.item_id, None);
                pb.set_prefix(result.name.clone());
                pb.set_position(100);
                match result.error {
                    Some(note) => pb.finish_with_message(format!("installed, warning: {}", note.message)),
                    None => pb.finish_with_message("installed"),
                }
            }
            PipelineEvent::Cancelled { item_id } => {
                self.bar(&item_id, None).abandon_with_message("cancelled");
            }
            PipelineEvent::Failed { item_id, error } => {
                self.bar(&item_id, None).abandon_with_message(format!("failed: {}", error));
            }
        }
    }
}

fn apply_progress(pb: &ProgressBar, progress: &DownloadProgress) {
    if progress.is_stalled() {
        pb.set_message("stalled, waiting for SteamCMD...");
        return;
    }
    pb.set_position(progress.percent.clamp(0, 100) as u64);
    let message = progress
        .message
        .clone()
        .unwrap_or_else(|| progress.stage.name().to_string());
    match progress.stage {
        ProgressStage::Error => pb.set_message(format!("error: {}", message)),
        _ => pb.set_message(message),
    }
}
