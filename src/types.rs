//! Core data model shared by the download pipeline.
//!
//! Items flow from the request queue into the orchestrator as
//! [`DownloadItem`]s, progress flows back out as [`DownloadProgress`]
//! events, and every run ends in exactly one [`DownloadResult`].

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// Percent value used by progress events to signal a stalled download.
pub const STALLED_PERCENT: i32 = -1;

/// Placeholder name for an item whose real name is not known yet
pub fn placeholder_name(id: &str) -> String {
    format!("Mod {}", id)
}

/// Whether `id` looks like a Steam Workshop item ID (ASCII digits only).
///
/// IDs become folder names under the staging and mods directories, so
/// anything else is refused before it reaches a path.
pub fn is_workshop_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// A single Workshop item selected for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    /// Workshop item ID (assigned by Steam)
    pub id: String,
    /// Display name
    pub name: String,
    /// Whether this item is a collection of other items
    #[serde(default)]
    pub is_collection: bool,
    /// Member IDs when this item is a collection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl DownloadItem {
    /// A plain mod item.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_collection: false,
            members: Vec::new(),
        }
    }

    /// A plain mod item named after its ID.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let name = placeholder_name(&id);
        Self::new(id, name)
    }

    /// A collection item with its member IDs.
    pub fn collection(
        id: impl Into<String>,
        name: impl Into<String>,
        members: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_collection: true,
            members,
        }
    }

    /// Items the pipeline actually downloads for this entry.
    ///
    /// A collection with members expands into those members (in order);
    /// anything else yields itself.
    pub fn expand(&self) -> Vec<DownloadItem> {
        if self.is_collection && !self.members.is_empty() {
            self.members.iter().map(DownloadItem::from_id).collect()
        } else {
            vec![self.clone()]
        }
    }
}

/// Stage reported by a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Connecting,
    Downloading,
    Moving,
    Completed,
    Error,
}

impl ProgressStage {
    pub fn name(&self) -> &'static str {
        match self {
            ProgressStage::Connecting => "connecting",
            ProgressStage::Downloading => "downloading",
            ProgressStage::Moving => "moving",
            ProgressStage::Completed => "completed",
            ProgressStage::Error => "error",
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ephemeral progress event for one item.
///
/// `percent` is 0-100, or [`STALLED_PERCENT`] when the external tool has
/// gone quiet for longer than the activity timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub stage: ProgressStage,
    pub percent: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DownloadProgress {
    pub fn new(stage: ProgressStage, percent: i32) -> Self {
        Self {
            stage,
            percent,
            current: None,
            total: None,
            message: None,
        }
    }

    /// Stalled marker: no output for longer than the activity timeout.
    pub fn stalled(message: impl Into<String>) -> Self {
        Self::new(ProgressStage::Downloading, STALLED_PERCENT).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_counts(mut self, current: u64, total: u64) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        self
    }

    pub fn is_stalled(&self) -> bool {
        self.percent < 0
    }
}

/// Stable error categories callers can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Required path or setting missing
    Configuration,
    /// External tool failed to spawn, failed, or reported an error
    Process,
    /// User asked for it; never shown as a failure
    Cancelled,
    /// Hard timeout elapsed
    Timeout,
    /// Copy/move into the mods folder failed
    Filesystem,
    /// Manifest missing or unreadable
    Validation,
    /// Workshop page could not be fetched
    Network,
    /// Another download is already running
    Busy,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "E_CONFIG",
            ErrorKind::Process => "E_PROCESS",
            ErrorKind::Cancelled => "E_CANCELLED",
            ErrorKind::Timeout => "E_TIMEOUT",
            ErrorKind::Filesystem => "E_FILESYSTEM",
            ErrorKind::Validation => "E_VALIDATION",
            ErrorKind::Network => "E_NETWORK",
            ErrorKind::Busy => "E_BUSY",
        }
    }
}

/// Classified error attached to a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

/// Terminal status of one item's pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Completed,
    Cancelled,
    Error,
}

/// Outcome of one item's pipeline run.
///
/// A `Completed` result may still carry a `Validation` error annotation
/// when the mod was moved but its manifest is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub item_id: String,
    pub name: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub supported_versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl DownloadResult {
    pub fn completed(
        item_id: impl Into<String>,
        name: impl Into<String>,
        local_path: PathBuf,
        supported_versions: Vec<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            name: name.into(),
            status: ItemStatus::Completed,
            local_path: Some(local_path),
            supported_versions,
            error: None,
        }
    }

    pub fn cancelled(item_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            name: name.into(),
            status: ItemStatus::Cancelled,
            local_path: None,
            supported_versions: Vec::new(),
            error: None,
        }
    }

    pub fn failed(item_id: impl Into<String>, name: impl Into<String>, error: ErrorInfo) -> Self {
        Self {
            item_id: item_id.into(),
            name: name.into(),
            status: ItemStatus::Error,
            local_path: None,
            supported_versions: Vec::new(),
            error: Some(error),
        }
    }

    /// Attach a non-fatal annotation (e.g. a validation warning).
    pub fn with_annotation(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn success(&self) -> bool {
        self.status == ItemStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ItemStatus::Cancelled
    }
}

/// Another item declared as required by a Workshop item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_optional: bool,
}

impl Dependency {
    pub fn required(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_optional: false,
        }
    }

    pub fn to_item(&self) -> DownloadItem {
        DownloadItem::new(self.id.clone(), self.name.clone())
    }
}

/// Metadata scraped from a Workshop item page.
///
/// Any list may be empty when the page changed shape; that is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModVersionInfo {
    /// Declared game versions (major.minor, deduplicated)
    pub supported_versions: Vec<String>,
    pub mod_name: String,
    pub dependencies: Vec<Dependency>,
}

impl ModVersionInfo {
    /// Whether the item declares versions and none of them is `game_version`.
    ///
    /// Items that declare nothing are never treated as mismatched.
    pub fn excludes_version(&self, game_version: &str) -> bool {
        if self.supported_versions.is_empty() {
            return false;
        }
        let wanted = major_minor(game_version).unwrap_or_else(|| game_version.trim().to_string());
        !self.supported_versions.iter().any(|v| *v == wanted)
    }
}

/// An item waiting in the client-side pending batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQueueEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_collection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl PendingQueueEntry {
    /// Name to show the user: the scraped name when known.
    pub fn display_name(&self) -> &str {
        self.resolved_name.as_deref().unwrap_or(&self.name)
    }

    pub fn to_item(&self) -> DownloadItem {
        DownloadItem {
            id: self.id.clone(),
            name: self.display_name().to_string(),
            is_collection: self.is_collection,
            members: self.members.clone(),
        }
    }
}

impl From<&DownloadItem> for PendingQueueEntry {
    fn from(item: &DownloadItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            is_collection: item.is_collection,
            resolved_name: None,
            members: item.members.clone(),
        }
    }
}

/// Reduce a version string to `major.minor` (`"1.5.4063"` -> `"1.5"`).
pub fn major_minor(version: &str) -> Option<String> {
    let mut parts = version.trim().split('.');
    let major = parts.next().filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))?;
    let minor = parts.next().filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))?;
    Some(format!("{}.{}", major, minor))
}

/// Order `major.minor` strings numerically (`1.9` before `1.10`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn key(v: &str) -> (u64, u64) {
        let mut parts = v.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
        (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
    }
    key(a).cmp(&key(b)).then_with(|| a.cmp(b))
}
