//! Mod processor
//!
//! Moves a finished download from the SteamCMD staging folder into the
//! active mods folder and validates it.
//!
//! The move never writes to the final path directly:
//! 1. copy staging -> `.temp_<id>_<millis>_<rand>` beside the target
//! 2. remove any previous version at the target
//! 3. rename temp -> target (the commit point)
//! 4. check the target exists
//!
//! Any failure after step 1 started removes the temp folder again.

pub mod manifest;

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ConfigProvider;
use crate::types::{is_workshop_id, ErrorKind};

pub use manifest::{manifest_path, parse_manifest, Manifest};

/// Processor errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("No active mods path configured")]
    NoActiveTarget,

    #[error("Invalid Workshop item ID: {0:?}")]
    InvalidId(String),

    #[error("Source mod folder not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove existing mod at {path}: {source}")]
    RemoveExisting {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to verify mod at target location after move: {0}")]
    MoveFailed(PathBuf),

    #[error("Move task failed: {0}")]
    Task(String),
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::NoActiveTarget | ProcessError::InvalidId(_) => ErrorKind::Configuration,
            _ => ErrorKind::Filesystem,
        }
    }
}

/// What validation found inside a mod folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetails {
    pub has_manifest: bool,
    pub mod_name: Option<String>,
    pub supported_versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub item_id: String,
    pub valid: bool,
    pub details: Option<ValidationDetails>,
    pub error: Option<String>,
}

impl ValidationResult {
    fn invalid(item_id: &str, error: String) -> Self {
        Self {
            item_id: item_id.to_string(),
            valid: false,
            details: None,
            error: Some(error),
        }
    }
}

/// A completed move
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    pub item_id: String,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    /// Non-fatal findings, e.g. a missing manifest at the final location
    pub warnings: Vec<String>,
}

/// Moves downloads into the active mods folder
pub struct ModProcessor {
    config: Arc<dyn ConfigProvider>,
}

impl ModProcessor {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self { config }
    }

    /// Staging folder SteamCMD put `item_id` in
    pub fn source_path(&self, item_id: &str) -> Result<PathBuf, ProcessError> {
        check_id(item_id)?;
        Ok(self.config.steamcmd_download_dir().join(item_id))
    }

    /// Final location of `item_id`
    pub fn target_path(&self, item_id: &str) -> Result<PathBuf, ProcessError> {
        check_id(item_id)?;
        self.config
            .active_mods_dir()
            .map(|dir| dir.join(item_id))
            .ok_or(ProcessError::NoActiveTarget)
    }

    /// Check `path` for a manifest and read what it declares.
    ///
    /// Read-only; repeated calls on an unchanged folder give equal results.
    pub async fn validate_item(&self, item_id: &str, path: &Path) -> ValidationResult {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                return ValidationResult::invalid(item_id, format!("Failed to validate mod: {}", e))
            }
        };
        if !meta.is_dir() {
            return ValidationResult::invalid(
                item_id,
                format!("Path is not a directory: {}", path.display()),
            );
        }

        let manifest_file = manifest_path(path);
        let has_manifest = tokio::fs::try_exists(&manifest_file).await.unwrap_or(false);

        let mut parsed = Manifest::default();
        if has_manifest {
            match tokio::fs::read(&manifest_file).await {
                Ok(bytes) => parsed = parse_manifest(&String::from_utf8_lossy(&bytes)),
                Err(e) => warn!("Failed to read manifest for mod {}: {}", item_id, e),
            }
        }

        ValidationResult {
            item_id: item_id.to_string(),
            valid: has_manifest,
            details: Some(ValidationDetails {
                has_manifest,
                mod_name: parsed.name,
                supported_versions: parsed.supported_versions,
            }),
            error: (!has_manifest)
                .then(|| format!("Missing About/About.xml in {}", path.display())),
        }
    }

    /// Move a downloaded item into the active mods folder
    pub async fn process_item(&self, item_id: &str) -> Result<ProcessResult, ProcessError> {
        let source = self.source_path(item_id)?;
        let target = self.target_path(item_id)?;
        let target_root = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or(ProcessError::NoActiveTarget)?;

        info!("Processing mod {}", item_id);
        debug!("Source: {}", source.display());
        debug!("Target: {}", target.display());

        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(ProcessError::SourceNotFound(source));
        }

        let before = self.validate_item(item_id, &source).await;
        if !before.valid {
            // SteamCMD may still be syncing the manifest; keep going
            warn!(
                "Mod {} validation warning: {}",
                item_id,
                before.error.as_deref().unwrap_or("invalid")
            );
        }

        tokio::fs::create_dir_all(&target_root)
            .await
            .map_err(|source| ProcessError::CreateDir {
                path: target_root.clone(),
                source,
            })?;

        let temp = target_root.join(temp_dir_name(item_id));
        {
            let (source, temp, target) = (source.clone(), temp.clone(), target.clone());
            tokio::task::spawn_blocking(move || commit_move(&source, &temp, &target))
                .await
                .map_err(|e| ProcessError::Task(e.to_string()))??;
        }

        let mut warnings = Vec::new();
        let after = self.validate_item(item_id, &target).await;
        if !after.valid {
            let warning = after
                .error
                .unwrap_or_else(|| "Mod failed validation after move".to_string());
            warn!("Mod {} post-move validation: {}", item_id, warning);
            warnings.push(warning);
        }

        info!("Mod {} installed to {}", item_id, target.display());
        Ok(ProcessResult {
            item_id: item_id.to_string(),
            source_path: source,
            target_path: target,
            warnings,
        })
    }
}

fn check_id(item_id: &str) -> Result<(), ProcessError> {
    if is_workshop_id(item_id) {
        Ok(())
    } else {
        Err(ProcessError::InvalidId(item_id.to_string()))
    }
}

/// Unique temp folder name for one move of `item_id`
fn temp_dir_name(item_id: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        ".temp_{}_{}_{}",
        item_id,
        chrono::Utc::now().timestamp_millis(),
        &nonce[..8]
    )
}

/// Copy into `temp`, then swap it in at `target`. Cleans up `temp` on error.
fn commit_move(source: &Path, temp: &Path, target: &Path) -> Result<(), ProcessError> {
    debug!("Copying {} to {}", source.display(), temp.display());
    let result = copy_tree(source, temp).and_then(|()| replace_target(temp, target));

    if result.is_err() && temp.exists() {
        debug!("Removing temp folder {}", temp.display());
        if let Err(e) = fs::remove_dir_all(temp) {
            warn!("Failed to remove temp folder {}: {}", temp.display(), e);
        }
    }
    result
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), ProcessError> {
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| ProcessError::Walk {
            path: source.to_path_buf(),
            source: e,
        })?;
        let Ok(rel) = entry.path().strip_prefix(source) else {
            continue;
        };
        let to = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&to).map_err(|e| ProcessError::CreateDir {
                path: to.clone(),
                source: e,
            })?;
        } else {
            reflink_copy::reflink_or_copy(entry.path(), &to).map_err(|e| ProcessError::Copy {
                from: entry.path().to_path_buf(),
                to: to.clone(),
                source: e,
            })?;
        }
    }
    Ok(())
}

fn replace_target(temp: &Path, target: &Path) -> Result<(), ProcessError> {
    if let Ok(meta) = fs::symlink_metadata(target) {
        info!("Removing existing mod at {}", target.display());
        let removed = if meta.is_dir() {
            fs::remove_dir_all(target)
        } else {
            fs::remove_file(target)
        };
        removed.map_err(|source| ProcessError::RemoveExisting {
            path: target.to_path_buf(),
            source,
        })?;
    }

    fs::rename(temp, target).map_err(|source| ProcessError::Rename {
        from: temp.to_path_buf(),
        to: target.to_path_buf(),
        source,
    })?;

    if !target.exists() {
        return Err(ProcessError::MoveFailed(target.to_path_buf()));
    }
    Ok(())
}
