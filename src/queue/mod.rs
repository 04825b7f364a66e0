//! Client request queue
//!
//! Entry point for user download requests. Each request runs the version
//! and dependency checks in [`flow`], asking the user through a
//! [`DecisionPrompt`] where the settings say so, and then either submits
//! right away ("download now") or accumulates into a pending batch
//! ("add to queue") that is later handed to the orchestrator in one go.

pub mod flow;

pub use flow::{
    AbandonReason, FlowSettings, FlowState, MismatchChoice, MismatchDecision, RequestFlow,
    VersionMismatch,
};

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ConfigProvider;
use crate::orchestrator::DownloadOrchestrator;
use crate::types::{Dependency, DownloadItem, DownloadResult, PendingQueueEntry};
use crate::workshop::MetadataSource;

/// User decisions the checks may need
#[async_trait]
pub trait DecisionPrompt: Send + Sync {
    /// Force or skip an item that does not list the game version.
    /// `None` means the prompt was dismissed.
    async fn resolve_version_mismatch(&self, mismatch: &VersionMismatch)
        -> Option<MismatchDecision>;

    /// IDs of the dependencies to download along with `item`.
    /// `None` means the prompt was dismissed.
    async fn select_dependencies(
        &self,
        item: &DownloadItem,
        dependencies: &[Dependency],
    ) -> Option<Vec<String>>;

    /// Whether to download the pending batch now
    async fn confirm_pending_batch(&self, pending: &[PendingQueueEntry]) -> bool;
}

/// Where checked items go to be downloaded
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    async fn submit(&self, items: Vec<DownloadItem>) -> Vec<DownloadResult>;
}

#[async_trait]
impl BatchSubmitter for DownloadOrchestrator {
    async fn submit(&self, items: Vec<DownloadItem>) -> Vec<DownloadResult> {
        self.download_batch(&items).await
    }
}

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("The download queue is empty")]
    Empty,

    #[error("Mod {0} is not in the download queue")]
    NotQueued(String),
}

/// How a user action ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Items were downloaded (or attempted)
    Submitted(Vec<DownloadResult>),
    /// Items were added to the pending batch
    Queued { added: Vec<String>, pending: usize },
    /// The checks ended the action
    Abandoned(AbandonReason),
    /// The user declined to download the pending batch now
    PendingKept { pending: usize },
}

/// Request queue with a pending batch
pub struct RequestQueue {
    config: Arc<dyn ConfigProvider>,
    metadata: Arc<dyn MetadataSource>,
    prompt: Arc<dyn DecisionPrompt>,
    submitter: Arc<dyn BatchSubmitter>,
    pending: Mutex<Vec<PendingQueueEntry>>,
}

impl RequestQueue {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        metadata: Arc<dyn MetadataSource>,
        prompt: Arc<dyn DecisionPrompt>,
        submitter: Arc<dyn BatchSubmitter>,
    ) -> Self {
        Self {
            config,
            metadata,
            prompt,
            submitter,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Check `item` and download it immediately.
    ///
    /// With items already pending, the item joins the pending batch instead
    /// and the user is asked to confirm the whole batch, so queued items are
    /// never silently left behind.
    pub async fn download_now(&self, item: DownloadItem) -> QueueOutcome {
        if !self.is_empty() {
            info!(
                "{} mods pending, adding {} to the queue first",
                self.len(),
                item.id
            );
            if let QueueOutcome::Abandoned(reason) = self.add_to_queue(item).await {
                debug!("New request abandoned ({:?}), pending batch unchanged", reason);
            }
            return self.offer_pending().await;
        }

        match self.run_checks(item).await {
            Ok(items) => QueueOutcome::Submitted(self.submitter.submit(items).await),
            Err(reason) => QueueOutcome::Abandoned(reason),
        }
    }

    /// Check `item` and add it, plus any chosen dependencies, to the
    /// pending batch. IDs already pending are not added again.
    pub async fn add_to_queue(&self, item: DownloadItem) -> QueueOutcome {
        let requested_name = item.name.clone();
        let items = match self.run_checks(item).await {
            Ok(items) => items,
            Err(reason) => return QueueOutcome::Abandoned(reason),
        };

        let mut added = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let mut entry = PendingQueueEntry::from(item);
            if i == 0 && item.name != requested_name {
                entry.name = requested_name.clone();
                entry.resolved_name = Some(item.name.clone());
            }
            if self.add_entry(entry) {
                added.push(item.id.clone());
            }
        }

        let pending = self.len();
        info!("Queued {:?}, {} mods pending", added, pending);
        QueueOutcome::Queued { added, pending }
    }

    /// Hand the pending batch to the orchestrator and clear it
    pub async fn submit_queue(&self) -> Result<Vec<DownloadResult>, QueueError> {
        let entries = std::mem::take(&mut *self.lock_pending());
        if entries.is_empty() {
            return Err(QueueError::Empty);
        }

        info!("Submitting {} queued mods", entries.len());
        let items = entries.iter().map(PendingQueueEntry::to_item).collect();
        Ok(self.submitter.submit(items).await)
    }

    /// Add an entry unless its ID is already pending. Returns true if added.
    pub fn add_entry(&self, entry: PendingQueueEntry) -> bool {
        let mut pending = self.lock_pending();
        if pending.iter().any(|e| e.id == entry.id) {
            debug!("Mod {} already queued", entry.id);
            return false;
        }
        pending.push(entry);
        true
    }

    pub fn remove(&self, item_id: &str) -> Result<PendingQueueEntry, QueueError> {
        let mut pending = self.lock_pending();
        let idx = pending
            .iter()
            .position(|e| e.id == item_id)
            .ok_or_else(|| QueueError::NotQueued(item_id.to_string()))?;
        Ok(pending.remove(idx))
    }

    pub fn clear(&self) {
        self.lock_pending().clear();
    }

    /// Snapshot of the pending batch
    pub fn pending(&self) -> Vec<PendingQueueEntry> {
        self.lock_pending().clone()
    }

    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_pending().is_empty()
    }

    /// Show the pending batch and submit it if the user confirms
    pub async fn offer_pending(&self) -> QueueOutcome {
        let pending = self.pending();
        if pending.is_empty() {
            return QueueOutcome::PendingKept { pending: 0 };
        }
        if !self.prompt.confirm_pending_batch(&pending).await {
            return QueueOutcome::PendingKept {
                pending: pending.len(),
            };
        }
        match self.submit_queue().await {
            Ok(results) => QueueOutcome::Submitted(results),
            Err(_) => QueueOutcome::PendingKept { pending: 0 },
        }
    }

    /// Drive one [`RequestFlow`] to its end, doing the fetches and prompts
    /// each state asks for
    async fn run_checks(&self, item: DownloadItem) -> Result<Vec<DownloadItem>, AbandonReason> {
        let id = item.id.clone();
        let mut flow = RequestFlow::new(item, FlowSettings::from_config(self.config.as_ref()));
        flow.start();

        loop {
            let state = flow.state().clone();
            match state {
                FlowState::Idle => {
                    flow.start();
                }
                FlowState::CheckingVersion => {
                    let fetched = self.metadata.scrape_version_info(&id).await;
                    flow.on_version_info(fetched);
                }
                FlowState::AwaitingVersionDecision(mismatch) => {
                    let decision = self.prompt.resolve_version_mismatch(&mismatch).await;
                    if let Some(mode) = decision.and_then(|d| d.remembered_mode()) {
                        if let Err(e) = self.config.remember_mismatch_mode(mode) {
                            warn!("Could not save version mismatch choice: {}", e);
                        }
                    }
                    flow.on_version_decision(decision);
                }
                FlowState::CheckingDependencies => {
                    let fetched = match flow.cached_info() {
                        Some(info) => Ok(info.dependencies.clone()),
                        None => self
                            .metadata
                            .scrape_version_info(&id)
                            .await
                            .map(|info| info.dependencies),
                    };
                    flow.on_dependencies(fetched);
                }
                FlowState::AwaitingDependencySelection(deps) => {
                    let selection = self.prompt.select_dependencies(flow.item(), &deps).await;
                    flow.on_dependency_selection(selection);
                }
                FlowState::Submitted(items) => return Ok(items),
                FlowState::Abandoned(reason) => {
                    info!("Request for mod {} ended: {:?}", id, reason);
                    return Err(reason);
                }
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingQueueEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
