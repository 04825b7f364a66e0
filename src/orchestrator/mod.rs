//! Download orchestrator
//!
//! Drives one item through the pipeline:
//!
//! `queued -> connecting -> downloading -> moving -> validating -> completed`
//!
//! with `cancelled` and `error` as the other terminal states. Batches run the
//! same pipeline strictly one item after another.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::processor::ModProcessor;
use crate::steamcmd::DownloadTool;
use crate::types::{
    DownloadItem, DownloadProgress, DownloadResult, ErrorInfo, ErrorKind, ItemStatus,
    ProgressStage,
};

/// Callback receiving pipeline events
pub type EventCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Per-item pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Queued,
    Connecting,
    Downloading,
    Moving,
    Validating,
    Completed,
    Cancelled,
    Error,
}

impl ItemState {
    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Queued => "queued",
            ItemState::Connecting => "connecting",
            ItemState::Downloading => "downloading",
            ItemState::Moving => "moving",
            ItemState::Validating => "validating",
            ItemState::Completed => "completed",
            ItemState::Cancelled => "cancelled",
            ItemState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed | ItemState::Cancelled | ItemState::Error
        )
    }

    /// States in which a cancel request still stops the item
    fn is_cancellable(&self) -> bool {
        matches!(
            self,
            ItemState::Queued | ItemState::Connecting | ItemState::Downloading
        )
    }
}

/// Events published to the progress sink
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An item entered the pipeline
    Started { item_id: String, name: String },
    /// Tool or pipeline progress for an item
    Progress {
        item_id: String,
        progress: DownloadProgress,
    },
    StateChanged { item_id: String, state: ItemState },
    /// Emitted before each batch item starts (index is 1-based)
    Batch {
        index: usize,
        total: usize,
        name: String,
    },
    /// Terminal success, possibly with a validation annotation
    Completed(DownloadResult),
    /// Terminal cancellation; not a failure
    Cancelled { item_id: String },
    /// Terminal failure
    Failed { item_id: String, error: ErrorInfo },
}

/// The item currently in the pipeline
struct ActiveRun {
    item_id: String,
    state: ItemState,
    cancel: CancellationToken,
}

type RunSlot = Arc<Mutex<Option<ActiveRun>>>;

/// Clears the run slot when an item leaves the pipeline
struct RunGuard {
    slot: RunSlot,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Coordinates the download tool and the mod processor
pub struct DownloadOrchestrator {
    tool: Arc<dyn DownloadTool>,
    processor: Arc<ModProcessor>,
    event_callback: Option<EventCallback>,
    run: RunSlot,
}

impl DownloadOrchestrator {
    pub fn new(tool: Arc<dyn DownloadTool>, processor: Arc<ModProcessor>) -> Self {
        Self {
            tool,
            processor,
            event_callback: None,
            run: Arc::new(Mutex::new(None)),
        }
    }

    /// Set event callback
    pub fn set_event_callback(&mut self, callback: EventCallback) {
        self.event_callback = Some(callback);
    }

    fn report(&self, event: PipelineEvent) {
        if let Some(ref callback) = self.event_callback {
            callback(event);
        }
    }

    /// Item ID and state of the item in the pipeline, if any
    pub fn current(&self) -> Option<(String, ItemState)> {
        self.lock_run()
            .as_ref()
            .map(|run| (run.item_id.clone(), run.state))
    }

    pub fn is_busy(&self) -> bool {
        self.lock_run().is_some() || self.tool.is_downloading()
    }

    /// Cancel the active item.
    ///
    /// Returns true iff an item was still in a cancellable stage. Once this
    /// returns true the item ends `cancelled`, even if the tool finishes
    /// successfully right afterwards.
    pub fn cancel(&self) -> bool {
        let requested = {
            let guard = self.lock_run();
            match guard.as_ref() {
                Some(run) if run.state.is_cancellable() && !run.cancel.is_cancelled() => {
                    info!("Cancel requested for mod {}", run.item_id);
                    run.cancel.cancel();
                    true
                }
                _ => false,
            }
        };
        if requested {
            self.tool.cancel();
        }
        requested
    }

    /// Run one item through download, move and validation
    pub async fn download_item(&self, item: &DownloadItem) -> DownloadResult {
        let (guard, cancel) = match self.begin(item) {
            Ok(started) => started,
            Err(busy) => {
                warn!("Rejecting mod {}: {}", item.id, busy);
                self.report(PipelineEvent::Failed {
                    item_id: item.id.clone(),
                    error: busy.clone(),
                });
                return DownloadResult::failed(&item.id, &item.name, busy);
            }
        };

        self.report(PipelineEvent::Started {
            item_id: item.id.clone(),
            name: item.name.clone(),
        });
        self.report(PipelineEvent::StateChanged {
            item_id: item.id.clone(),
            state: ItemState::Queued,
        });

        let result = self.run_pipeline(item, &cancel).await;

        match result.status {
            ItemStatus::Completed => {
                info!("Mod {} completed", item.id);
                self.enter(&item.id, ItemState::Completed);
                self.report(PipelineEvent::Completed(result.clone()));
            }
            ItemStatus::Cancelled => {
                info!("Mod {} cancelled", item.id);
                self.enter(&item.id, ItemState::Cancelled);
                self.report(PipelineEvent::Cancelled {
                    item_id: item.id.clone(),
                });
            }
            ItemStatus::Error => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::new(ErrorKind::Process, "Download failed"));
                warn!("Mod {} failed: {}", item.id, error);
                self.enter(&item.id, ItemState::Error);
                self.report(PipelineEvent::Failed {
                    item_id: item.id.clone(),
                    error,
                });
            }
        }

        drop(guard);
        result
    }

    /// Run items strictly in order; a failed item does not stop the batch.
    ///
    /// Collections with members are expanded into their members and repeated
    /// IDs are only downloaded once.
    pub async fn download_batch(&self, items: &[DownloadItem]) -> Vec<DownloadResult> {
        let plan = plan_batch(items);
        let total = plan.len();
        info!("Starting batch of {} mods", total);

        let mut results = Vec::with_capacity(total);
        for (i, item) in plan.iter().enumerate() {
            self.report(PipelineEvent::Batch {
                index: i + 1,
                total,
                name: item.name.clone(),
            });
            results.push(self.download_item(item).await);
        }

        let ok = results.iter().filter(|r| r.success()).count();
        info!("Batch finished: {}/{} completed", ok, total);
        results
    }

    fn begin(&self, item: &DownloadItem) -> Result<(RunGuard, CancellationToken), ErrorInfo> {
        let mut slot = self.lock_run();
        if let Some(run) = slot.as_ref() {
            return Err(busy_error(&run.item_id));
        }
        if let Some(other) = self.tool.current_item() {
            return Err(busy_error(&other));
        }

        let cancel = CancellationToken::new();
        *slot = Some(ActiveRun {
            item_id: item.id.clone(),
            state: ItemState::Queued,
            cancel: cancel.clone(),
        });
        Ok((
            RunGuard {
                slot: Arc::clone(&self.run),
            },
            cancel,
        ))
    }

    async fn run_pipeline(&self, item: &DownloadItem, cancel: &CancellationToken) -> DownloadResult {
        let id = item.id.as_str();
        self.enter(id, ItemState::Connecting);

        // Relay tool progress for this item only; dropped on every path out
        let relay = {
            let callback = self.event_callback.clone();
            let slot = Arc::clone(&self.run);
            let item_id = item.id.clone();
            let downloading = AtomicBool::new(false);
            self.tool.subscribe(Arc::new(move |progress: &DownloadProgress| {
                let first_download = progress.stage == ProgressStage::Downloading
                    && !downloading.swap(true, Ordering::SeqCst);
                if first_download {
                    if let Some(run) = slot.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
                        run.state = ItemState::Downloading;
                    }
                }

                let Some(ref callback) = callback else {
                    return;
                };
                if first_download {
                    callback(PipelineEvent::StateChanged {
                        item_id: item_id.clone(),
                        state: ItemState::Downloading,
                    });
                }
                callback(PipelineEvent::Progress {
                    item_id: item_id.clone(),
                    progress: progress.clone(),
                });
            }))
        };
        // A cancel before the tool started has nothing to kill; don't start it
        if cancel.is_cancelled() {
            info!("Mod {} cancelled before download started", id);
            return DownloadResult::cancelled(id, &item.name);
        }
        let downloaded = self.tool.download_item(id).await;
        drop(relay);

        if let Err(e) = downloaded {
            if e.is_cancelled() || cancel.is_cancelled() {
                return DownloadResult::cancelled(id, &item.name);
            }
            return DownloadResult::failed(id, &item.name, ErrorInfo::new(e.kind(), e.to_string()));
        }

        // Checked and switched under one lock so a racing cancel cannot slip
        // between the two
        if !self.enter_unless_cancelled(id, ItemState::Moving, cancel) {
            info!("Mod {} finished downloading after cancel, discarding", id);
            return DownloadResult::cancelled(id, &item.name);
        }
        self.progress(
            id,
            DownloadProgress::new(ProgressStage::Moving, 95).with_message("Moving to mods folder..."),
        );

        let processed = match self.processor.process_item(id).await {
            Ok(processed) => processed,
            Err(e) => {
                let error = ErrorInfo::new(e.kind(), e.to_string());
                self.progress(
                    id,
                    DownloadProgress::new(ProgressStage::Error, 0).with_message(error.message.clone()),
                );
                return DownloadResult::failed(id, &item.name, error);
            }
        };

        self.enter(id, ItemState::Validating);
        let validation = self
            .processor
            .validate_item(id, &processed.target_path)
            .await;

        let (name, versions) = match validation.details {
            Some(details) => (
                details.mod_name.unwrap_or_else(|| item.name.clone()),
                details.supported_versions,
            ),
            None => (item.name.clone(), Vec::new()),
        };
        let mut result = DownloadResult::completed(id, name, processed.target_path, versions);
        if !validation.valid {
            let message = validation
                .error
                .unwrap_or_else(|| "Mod failed validation".to_string());
            result = result.with_annotation(ErrorInfo::new(ErrorKind::Validation, message));
        }

        self.progress(
            id,
            DownloadProgress::new(ProgressStage::Completed, 100).with_message("Download complete"),
        );
        result
    }

    fn progress(&self, item_id: &str, progress: DownloadProgress) {
        self.report(PipelineEvent::Progress {
            item_id: item_id.to_string(),
            progress,
        });
    }

    fn enter(&self, item_id: &str, state: ItemState) {
        self.set_state(item_id, state);
        self.report(PipelineEvent::StateChanged {
            item_id: item_id.to_string(),
            state,
        });
    }

    fn enter_unless_cancelled(
        &self,
        item_id: &str,
        state: ItemState,
        cancel: &CancellationToken,
    ) -> bool {
        {
            let mut guard = self.lock_run();
            if cancel.is_cancelled() {
                return false;
            }
            if let Some(run) = guard.as_mut() {
                run.state = state;
            }
        }
        self.report(PipelineEvent::StateChanged {
            item_id: item_id.to_string(),
            state,
        });
        true
    }

    fn set_state(&self, item_id: &str, state: ItemState) {
        if let Some(run) = self.lock_run().as_mut() {
            if run.item_id == item_id {
                run.state = state;
            }
        }
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn busy_error(active_id: &str) -> ErrorInfo {
    ErrorInfo::new(
        ErrorKind::Busy,
        format!("A download is already in progress (mod {})", active_id),
    )
}

/// Expand collections and drop repeated IDs, keeping first occurrence order
pub fn plan_batch(items: &[DownloadItem]) -> Vec<DownloadItem> {
    let mut seen = HashSet::new();
    items
        .iter()
        .flat_map(DownloadItem::expand)
        .filter(|item| seen.insert(item.id.clone()))
        .collect()
}
