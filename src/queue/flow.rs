//! Request check sequence
//!
//! One user action ("download now" or "add to queue") walks through
//!
//! ```text
//! Idle -> CheckingVersion -> [AwaitingVersionDecision] -> CheckingDependencies
//!      -> [AwaitingDependencySelection] -> Submitted
//! ```
//!
//! or ends early in `Abandoned`. The flow does no I/O: the driver performs
//! the fetch or prompt a state asks for and feeds the answer back in.
//! Checks fail open, so a broken fetch never blocks the download.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::{ConfigProvider, DependencyMode, MismatchMode};
use crate::types::{placeholder_name, Dependency, DownloadItem, ModVersionInfo};
use crate::workshop::ScrapeError;

/// Why a request ended without submitting anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// Mismatch mode is `skip`
    VersionSkipped,
    /// The user chose "skip" at the mismatch prompt
    UserSkipped,
    /// The user dismissed a prompt
    UserCancelled,
}

/// The item does not declare the running game version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMismatch {
    pub item_id: String,
    pub item_name: String,
    pub mod_versions: Vec<String>,
    pub game_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchChoice {
    Force,
    Skip,
}

/// Answer to a version mismatch prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MismatchDecision {
    pub choice: MismatchChoice,
    /// Store the choice as the new default mismatch mode
    pub remember: bool,
}

impl MismatchDecision {
    /// Mismatch mode to persist, if the user asked to remember the choice
    pub fn remembered_mode(&self) -> Option<MismatchMode> {
        self.remember.then_some(match self.choice {
            MismatchChoice::Force => MismatchMode::Force,
            MismatchChoice::Skip => MismatchMode::Skip,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    CheckingVersion,
    AwaitingVersionDecision(VersionMismatch),
    CheckingDependencies,
    AwaitingDependencySelection(Vec<Dependency>),
    /// Final item list: the primary item first, then chosen dependencies
    Submitted(Vec<DownloadItem>),
    Abandoned(AbandonReason),
}

impl FlowState {
    pub fn is_finished(&self) -> bool {
        matches!(self, FlowState::Submitted(_) | FlowState::Abandoned(_))
    }
}

/// Settings the checks depend on, read once per action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSettings {
    pub skip_version_check: bool,
    pub game_version: Option<String>,
    pub mismatch_mode: MismatchMode,
    pub dependency_mode: DependencyMode,
}

impl FlowSettings {
    pub fn from_config(config: &dyn ConfigProvider) -> Self {
        Self {
            skip_version_check: config.skip_version_check(),
            game_version: config.game_version(),
            mismatch_mode: config.mismatch_mode(),
            dependency_mode: config.dependency_mode(),
        }
    }
}

/// Check sequence for one requested item
#[derive(Debug)]
pub struct RequestFlow {
    item: DownloadItem,
    settings: FlowSettings,
    state: FlowState,
    info: Option<ModVersionInfo>,
}

impl RequestFlow {
    pub fn new(item: DownloadItem, settings: FlowSettings) -> Self {
        Self {
            item,
            settings,
            state: FlowState::Idle,
            info: None,
        }
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// The requested item, renamed once the page told us its real name
    pub fn item(&self) -> &DownloadItem {
        &self.item
    }

    /// Metadata fetched by the version check, reused for dependencies
    pub fn cached_info(&self) -> Option<&ModVersionInfo> {
        self.info.as_ref()
    }

    pub fn start(&mut self) -> &FlowState {
        if !matches!(self.state, FlowState::Idle) {
            return self.ignored("start");
        }

        self.state = if self.item.is_collection {
            // Collection pages list members, not versions or requirements
            debug!("Collection {}: skipping checks", self.item.id);
            FlowState::Submitted(vec![self.item.clone()])
        } else if self.settings.skip_version_check {
            FlowState::CheckingDependencies
        } else {
            FlowState::CheckingVersion
        };
        &self.state
    }

    pub fn on_version_info(&mut self, fetched: Result<ModVersionInfo, ScrapeError>) -> &FlowState {
        if !matches!(self.state, FlowState::CheckingVersion) {
            return self.ignored("version info");
        }

        let info = match fetched {
            Ok(info) => info,
            Err(e) => {
                warn!("Version check failed for mod {}, continuing: {}", self.item.id, e);
                self.state = FlowState::CheckingDependencies;
                return &self.state;
            }
        };

        self.adopt_name(&info);
        let mismatch = self
            .settings
            .game_version
            .as_deref()
            .filter(|game| info.excludes_version(game))
            .map(|game| VersionMismatch {
                item_id: self.item.id.clone(),
                item_name: self.item.name.clone(),
                mod_versions: info.supported_versions.clone(),
                game_version: game.to_string(),
            });
        self.info = Some(info);

        self.state = match mismatch {
            None => FlowState::CheckingDependencies,
            Some(mismatch) => {
                info!(
                    "Mod {} supports {:?}, game is {} (mode: {})",
                    mismatch.item_id,
                    mismatch.mod_versions,
                    mismatch.game_version,
                    self.settings.mismatch_mode
                );
                match self.settings.mismatch_mode {
                    MismatchMode::Skip => FlowState::Abandoned(AbandonReason::VersionSkipped),
                    MismatchMode::Force => FlowState::CheckingDependencies,
                    MismatchMode::Ask => FlowState::AwaitingVersionDecision(mismatch),
                }
            }
        };
        &self.state
    }

    /// `None` means the prompt was dismissed
    pub fn on_version_decision(&mut self, decision: Option<MismatchDecision>) -> &FlowState {
        if !matches!(self.state, FlowState::AwaitingVersionDecision(_)) {
            return self.ignored("version decision");
        }

        self.state = match decision.map(|d| d.choice) {
            Some(MismatchChoice::Force) => FlowState::CheckingDependencies,
            Some(MismatchChoice::Skip) => FlowState::Abandoned(AbandonReason::UserSkipped),
            None => FlowState::Abandoned(AbandonReason::UserCancelled),
        };
        &self.state
    }

    pub fn on_dependencies(&mut self, fetched: Result<Vec<Dependency>, ScrapeError>) -> &FlowState {
        if !matches!(self.state, FlowState::CheckingDependencies) {
            return self.ignored("dependencies");
        }

        let deps = match fetched {
            Ok(deps) => self.clean_dependencies(deps),
            Err(e) => {
                warn!("Dependency check failed for mod {}, continuing: {}", self.item.id, e);
                Vec::new()
            }
        };

        self.state = if deps.is_empty() {
            FlowState::Submitted(vec![self.item.clone()])
        } else {
            match self.settings.dependency_mode {
                DependencyMode::Ignore => FlowState::Submitted(vec![self.item.clone()]),
                DependencyMode::Auto => {
                    let mut items = vec![self.item.clone()];
                    items.extend(deps.iter().map(Dependency::to_item));
                    FlowState::Submitted(items)
                }
                DependencyMode::Ask => FlowState::AwaitingDependencySelection(deps),
            }
        };
        &self.state
    }

    /// `Some(ids)` lists the dependencies to include; `None` dismisses the prompt
    pub fn on_dependency_selection(&mut self, selection: Option<Vec<String>>) -> &FlowState {
        let FlowState::AwaitingDependencySelection(deps) = &self.state else {
            return self.ignored("dependency selection");
        };

        self.state = match selection {
            None => FlowState::Abandoned(AbandonReason::UserCancelled),
            Some(ids) => {
                let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let mut items = vec![self.item.clone()];
                items.extend(
                    deps.iter()
                        .filter(|d| wanted.contains(d.id.as_str()))
                        .map(Dependency::to_item),
                );
                FlowState::Submitted(items)
            }
        };
        &self.state
    }

    fn adopt_name(&mut self, info: &ModVersionInfo) {
        let scraped = info.mod_name.trim();
        if !scraped.is_empty() && scraped != placeholder_name(&self.item.id) {
            self.item.name = scraped.to_string();
        }
    }

    fn clean_dependencies(&self, deps: Vec<Dependency>) -> Vec<Dependency> {
        let mut seen = HashSet::new();
        deps.into_iter()
            .filter(|d| d.id != self.item.id && seen.insert(d.id.clone()))
            .collect()
    }

    fn ignored(&self, what: &str) -> &FlowState {
        warn!(
            "Ignoring {} for mod {} in state {:?}",
            what, self.item.id, self.state
        );
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> FlowSettings {
        FlowSettings {
            skip_version_check: false,
            game_version: Some("1.6".to_string()),
            mismatch_mode: MismatchMode::Ask,
            dependency_mode: DependencyMode::Ask,
        }
    }

    fn info(versions: &[&str], deps: &[&str]) -> ModVersionInfo {
        ModVersionInfo {
            supported_versions: versions.iter().map(|v| v.to_string()).collect(),
            mod_name: "Real Name".to_string(),
            dependencies: deps
                .iter()
                .map(|id| Dependency::required(*id, format!("Dep {}", id)))
                .collect(),
        }
    }

    fn network_error() -> ScrapeError {
        ScrapeError::Status {
            item_id: "1".to_string(),
            status: reqwest::StatusCode::BAD_GATEWAY,
        }
    }

    fn ids(state: &FlowState) -> Vec<String> {
        match state {
            FlowState::Submitted(items) => items.iter().map(|i| i.id.clone()).collect(),
            other => panic!("not submitted: {:?}", other),
        }
    }

    #[test]
    fn test_matching_version_goes_to_dependencies() {
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        assert_eq!(flow.start(), &FlowState::CheckingVersion);
        assert_eq!(
            flow.on_version_info(Ok(info(&["1.5", "1.6"], &[]))),
            &FlowState::CheckingDependencies
        );
        assert_eq!(flow.item().name, "Real Name");
        assert_eq!(ids(flow.on_dependencies(Ok(Vec::new()))), vec!["1"]);
    }

    #[test]
    fn test_version_fetch_failure_fails_open() {
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        flow.start();
        assert_eq!(
            flow.on_version_info(Err(network_error())),
            &FlowState::CheckingDependencies
        );
        assert!(flow.cached_info().is_none());
        assert_eq!(flow.item().name, "Mod 1");
    }

    #[test]
    fn test_mismatch_modes() {
        let mut s = settings();
        s.mismatch_mode = MismatchMode::Skip;
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), s.clone());
        flow.start();
        assert_eq!(
            flow.on_version_info(Ok(info(&["1.4"], &[]))),
            &FlowState::Abandoned(AbandonReason::VersionSkipped)
        );

        s.mismatch_mode = MismatchMode::Force;
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), s);
        flow.start();
        assert_eq!(
            flow.on_version_info(Ok(info(&["1.4"], &[]))),
            &FlowState::CheckingDependencies
        );
    }

    #[test]
    fn test_ask_mode_waits_for_decision() {
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        flow.start();
        let state = flow.on_version_info(Ok(info(&["1.4", "1.5"], &[]))).clone();
        let FlowState::AwaitingVersionDecision(mismatch) = state else {
            panic!("expected a decision prompt");
        };
        assert_eq!(mismatch.game_version, "1.6");
        assert_eq!(mismatch.mod_versions, vec!["1.4", "1.5"]);
        assert_eq!(mismatch.item_name, "Real Name");

        let skip = MismatchDecision {
            choice: MismatchChoice::Skip,
            remember: false,
        };
        assert_eq!(
            flow.on_version_decision(Some(skip)),
            &FlowState::Abandoned(AbandonReason::UserSkipped)
        );
    }

    #[test]
    fn test_dismissed_prompts_abandon() {
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        flow.start();
        flow.on_version_info(Ok(info(&["1.4"], &[])));
        assert_eq!(
            flow.on_version_decision(None),
            &FlowState::Abandoned(AbandonReason::UserCancelled)
        );

        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        flow.start();
        flow.on_version_info(Ok(info(&[], &["2"])));
        flow.on_dependencies(Ok(info(&[], &["2"]).dependencies));
        assert_eq!(
            flow.on_dependency_selection(None),
            &FlowState::Abandoned(AbandonReason::UserCancelled)
        );
    }

    #[test]
    fn test_unknown_game_version_never_mismatches() {
        let mut s = settings();
        s.game_version = None;
        s.mismatch_mode = MismatchMode::Skip;
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), s);
        flow.start();
        assert_eq!(
            flow.on_version_info(Ok(info(&["1.0"], &[]))),
            &FlowState::CheckingDependencies
        );
    }

    #[test]
    fn test_skip_version_check_setting() {
        let mut s = settings();
        s.skip_version_check = true;
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), s);
        assert_eq!(flow.start(), &FlowState::CheckingDependencies);
    }

    #[test]
    fn test_dependency_modes() {
        let deps = info(&[], &["2", "3", "2", "1"]).dependencies;

        let mut s = settings();
        s.dependency_mode = DependencyMode::Ignore;
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), s.clone());
        flow.start();
        flow.on_version_info(Ok(ModVersionInfo::default()));
        assert_eq!(ids(flow.on_dependencies(Ok(deps.clone()))), vec!["1"]);

        s.dependency_mode = DependencyMode::Auto;
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), s);
        flow.start();
        flow.on_version_info(Ok(ModVersionInfo::default()));
        // Self-references and repeats are dropped
        assert_eq!(ids(flow.on_dependencies(Ok(deps.clone()))), vec!["1", "2", "3"]);

        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        flow.start();
        flow.on_version_info(Ok(ModVersionInfo::default()));
        let state = flow.on_dependencies(Ok(deps)).clone();
        assert!(matches!(state, FlowState::AwaitingDependencySelection(ref d) if d.len() == 2));
        assert_eq!(
            ids(flow.on_dependency_selection(Some(vec!["3".to_string(), "99".to_string()]))),
            vec!["1", "3"]
        );
    }

    #[test]
    fn test_dependency_fetch_failure_submits_primary() {
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        flow.start();
        flow.on_version_info(Err(network_error()));
        assert_eq!(ids(flow.on_dependencies(Err(network_error()))), vec!["1"]);
    }

    #[test]
    fn test_collections_skip_checks() {
        let coll = DownloadItem::collection("900", "Pack", vec!["1".into()]);
        let mut flow = RequestFlow::new(coll, settings());
        assert_eq!(ids(flow.start()), vec!["900"]);
    }

    #[test]
    fn test_out_of_order_input_is_ignored() {
        let mut flow = RequestFlow::new(DownloadItem::from_id("1"), settings());
        assert_eq!(flow.on_dependency_selection(Some(Vec::new())), &FlowState::Idle);
        flow.start();
        assert_eq!(flow.on_dependencies(Ok(Vec::new())), &FlowState::CheckingVersion);
        assert!(!flow.state().is_finished());
    }

    #[test]
    fn test_remembered_mode() {
        let d = MismatchDecision {
            choice: MismatchChoice::Force,
            remember: true,
        };
        assert_eq!(d.remembered_mode(), Some(MismatchMode::Force));
        let d = MismatchDecision {
            remember: false,
            ..d
        };
        assert_eq!(d.remembered_mode(), None);
    }
}
