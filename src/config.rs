//! Settings management
//!
//! Stores user preferences in ~/.config/rwmd/settings.json and exposes them
//! to the pipeline through the read-only [`ConfigProvider`] trait.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// How dependencies found on a Workshop page are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
    /// Let the user pick which dependencies to include
    #[default]
    Ask,
    /// Include every dependency without asking
    Auto,
    /// Download only the requested item
    Ignore,
}

/// What to do when a mod does not declare the current game version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchMode {
    /// Ask the user each time
    #[default]
    Ask,
    /// Download anyway
    Force,
    /// Silently drop the request
    Skip,
}

impl DependencyMode {
    pub fn name(&self) -> &'static str {
        match self {
            DependencyMode::Ask => "ask",
            DependencyMode::Auto => "auto",
            DependencyMode::Ignore => "ignore",
        }
    }
}

impl MismatchMode {
    pub fn name(&self) -> &'static str {
        match self {
            MismatchMode::Ask => "ask",
            MismatchMode::Force => "force",
            MismatchMode::Skip => "skip",
        }
    }
}

impl fmt::Display for DependencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for MismatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DependencyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ask" => Ok(DependencyMode::Ask),
            "auto" => Ok(DependencyMode::Auto),
            "ignore" => Ok(DependencyMode::Ignore),
            other => Err(ConfigError::InvalidValue {
                field: "dependency mode",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for MismatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ask" => Ok(MismatchMode::Ask),
            "force" => Ok(MismatchMode::Force),
            "skip" => Ok(MismatchMode::Skip),
            other => Err(ConfigError::InvalidValue {
                field: "version mismatch mode",
                value: other.to_string(),
            }),
        }
    }
}

/// A named mods folder; exactly one is active at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModsPath {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub is_active: bool,
}

/// SteamCMD locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteamCmdSettings {
    /// Path to the steamcmd executable (or a bare program name on PATH)
    #[serde(default = "default_steamcmd_executable")]
    pub executable_path: PathBuf,

    /// Directory SteamCMD downloads workshop items into
    #[serde(default = "default_steamcmd_download_dir")]
    pub download_path: PathBuf,
}

impl Default for SteamCmdSettings {
    fn default() -> Self {
        Self {
            executable_path: default_steamcmd_executable(),
            download_path: default_steamcmd_download_dir(),
        }
    }
}

/// Game-side settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSettings {
    /// Installed game version; empty when unknown
    #[serde(default = "default_game_version")]
    pub current_version: String,

    #[serde(default = "default_mods_paths")]
    pub mods_paths: Vec<ModsPath>,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            current_version: default_game_version(),
            mods_paths: default_mods_paths(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSettings {
    #[serde(default)]
    pub dependency_mode: DependencyMode,

    #[serde(default)]
    pub skip_version_check: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSettings {
    #[serde(default)]
    pub on_mismatch: MismatchMode,
}

/// User settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub steamcmd: SteamCmdSettings,

    #[serde(default)]
    pub game: GameSettings,

    #[serde(default)]
    pub download: DownloadSettings,

    #[serde(default)]
    pub version: VersionSettings,
}

fn documents_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Documents")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_steamcmd_executable() -> PathBuf {
    let exe = if cfg!(windows) { "steamcmd.exe" } else { "steamcmd.sh" };
    documents_dir().join("steamcmd").join(exe)
}

fn default_steamcmd_download_dir() -> PathBuf {
    documents_dir()
        .join("steamcmd")
        .join("steamapps")
        .join("workshop")
        .join("content")
        .join(crate::steamcmd::WORKSHOP_APP_ID)
}

fn default_game_version() -> String {
    "1.6".to_string()
}

fn default_mods_paths() -> Vec<ModsPath> {
    vec![ModsPath {
        id: uuid::Uuid::new_v4().to_string(),
        name: "Default Mods Folder".to_string(),
        path: documents_dir().join("RimWorld").join("Mods"),
        is_active: true,
    }]
}

impl Settings {
    /// Get the config directory path (~/.config/rwmd)
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        Ok(dirs::config_dir().ok_or(ConfigError::NoConfigDir)?.join("rwmd"))
    }

    /// Get the default settings file path
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save settings to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The currently active mods folder, if any
    pub fn active_mods_path(&self) -> Option<&ModsPath> {
        self.game.mods_paths.iter().find(|p| p.is_active)
    }

    /// Make the mods path with `id` the only active one
    pub fn activate_mods_path(&mut self, id: &str) -> bool {
        if !self.game.mods_paths.iter().any(|p| p.id == id) {
            return false;
        }
        for p in &mut self.game.mods_paths {
            p.is_active = p.id == id;
        }
        true
    }

    /// Register a mods folder, optionally making it the active one.
    /// Returns the new entry's ID.
    pub fn add_mods_path(&mut self, name: &str, path: PathBuf, activate: bool) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.game.mods_paths.push(ModsPath {
            id: id.clone(),
            name: name.to_string(),
            path,
            is_active: false,
        });
        if activate || self.active_mods_path().is_none() {
            self.activate_mods_path(&id);
        }
        id
    }

    /// Known game version, `None` when unset
    pub fn game_version(&self) -> Option<&str> {
        let v = self.game.current_version.trim();
        (!v.is_empty()).then_some(v)
    }
}

/// Read-only view of the configuration the pipeline needs.
///
/// The core never persists settings itself; the single write hook exists
/// for the "remember this choice" option of the version-mismatch prompt.
pub trait ConfigProvider: Send + Sync {
    fn steamcmd_executable(&self) -> PathBuf;
    fn steamcmd_download_dir(&self) -> PathBuf;
    fn active_mods_dir(&self) -> Option<PathBuf>;
    fn dependency_mode(&self) -> DependencyMode;
    fn mismatch_mode(&self) -> MismatchMode;
    fn skip_version_check(&self) -> bool;
    fn game_version(&self) -> Option<String>;
    fn remember_mismatch_mode(&self, mode: MismatchMode) -> Result<(), ConfigError>;
}

/// Settings held in memory, optionally backed by a JSON file
pub struct SettingsStore {
    path: Option<PathBuf>,
    settings: RwLock<Settings>,
}

impl SettingsStore {
    /// Store that never touches disk
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: None,
            settings: RwLock::new(settings),
        }
    }

    /// Load from `path`, falling back to defaults if the file is unreadable
    pub fn open(path: PathBuf) -> Self {
        let settings = match Settings::load_from(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!("Could not load settings: {}. Using defaults.", e);
                Settings::default()
            }
        };
        Self {
            path: Some(path),
            settings: RwLock::new(settings),
        }
    }

    /// Load from ~/.config/rwmd/settings.json
    pub fn open_default() -> Result<Self, ConfigError> {
        Ok(Self::open(Settings::default_path()?))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn snapshot(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `f` and persist the result when file-backed
    pub fn update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let snapshot = {
            let mut guard = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard);
            guard.clone()
        };
        match &self.path {
            Some(path) => snapshot.save_to(path),
            None => Ok(()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Settings) -> T) -> T {
        f(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ConfigProvider for SettingsStore {
    fn steamcmd_executable(&self) -> PathBuf {
        self.read(|s| s.steamcmd.executable_path.clone())
    }

    fn steamcmd_download_dir(&self) -> PathBuf {
        self.read(|s| s.steamcmd.download_path.clone())
    }

    fn active_mods_dir(&self) -> Option<PathBuf> {
        self.read(|s| s.active_mods_path().map(|p| p.path.clone()))
    }

    fn dependency_mode(&self) -> DependencyMode {
        self.read(|s| s.download.dependency_mode)
    }

    fn mismatch_mode(&self) -> MismatchMode {
        self.read(|s| s.version.on_mismatch)
    }

    fn skip_version_check(&self) -> bool {
        self.read(|s| s.download.skip_version_check)
    }

    fn game_version(&self) -> Option<String> {
        self.read(|s| s.game_version().map(str::to_string))
    }

    fn remember_mismatch_mode(&self, mode: MismatchMode) -> Result<(), ConfigError> {
        self.update(|s| s.version.on_mismatch = mode)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(serde_json::Error),

    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.game_version(), Some("1.6"));
        assert_eq!(settings.download.dependency_mode, DependencyMode::Ask);
        assert_eq!(settings.version.on_mismatch, MismatchMode::Ask);
        assert!(!settings.download.skip_version_check);
        assert!(settings.active_mods_path().is_some());
        assert!(settings
            .steamcmd
            .download_path
            .ends_with("steamapps/workshop/content/294100"));
    }

    #[test]
    fn test_only_one_active_mods_path() {
        let mut settings = Settings::default();
        let id = settings.add_mods_path("Second", PathBuf::from("/mods/two"), true);

        let active: Vec<_> = settings.game.mods_paths.iter().filter(|p| p.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);

        assert!(!settings.activate_mods_path("missing"));
        assert_eq!(settings.active_mods_path().unwrap().id, id);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.download.dependency_mode = DependencyMode::Auto;
        settings.game.current_version = "1.5".to_string();
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, r#"{"version": {"on_mismatch": "skip"}}"#).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.version.on_mismatch, MismatchMode::Skip);
        assert_eq!(loaded.game.current_version, "1.6");
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(Settings::load_from(&path), Err(ConfigError::Parse { .. })));
        let store = SettingsStore::open(path);
        assert_eq!(store.mismatch_mode(), MismatchMode::Ask);
    }

    #[test]
    fn test_remember_mismatch_mode_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        let store = SettingsStore::open(path.clone());

        store.remember_mismatch_mode(MismatchMode::Force).unwrap();
        assert_eq!(store.mismatch_mode(), MismatchMode::Force);
        assert_eq!(
            Settings::load_from(&path).unwrap().version.on_mismatch,
            MismatchMode::Force
        );
    }

    #[test]
    fn test_empty_game_version_is_unknown() {
        let mut settings = Settings::default();
        settings.game.current_version = "  ".to_string();
        let store = SettingsStore::in_memory(settings);
        assert_eq!(store.game_version(), None);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("AUTO".parse::<DependencyMode>().unwrap(), DependencyMode::Auto);
        assert_eq!("force".parse::<MismatchMode>().unwrap(), MismatchMode::Force);
        assert!("sometimes".parse::<MismatchMode>().is_err());
    }
}
