//! SteamCMD adapter
//!
//! Runs `steamcmd +login anonymous +workshop_download_item 294100 <id> +quit`
//! as a child process and turns its console output into progress events.
//!
//! Timeouts, all started when the process is spawned:
//! - connect: no output at all yet, reports "still connecting" (advisory)
//! - activity: silence after output started, reports a stalled event (advisory)
//! - hard: total runtime cap, terminates the process and fails the call
//!
//! One adapter runs at most one download at a time. A second request while
//! one is active is rejected with [`SteamCmdError::Busy`].

pub mod parser;

pub use parser::{ProgressParser, SteamCmdParser, Verdict};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigProvider;
use crate::progress::{ProgressHub, ProgressListener, Subscription};
use crate::types::{DownloadProgress, ErrorKind, ProgressStage};

/// Steam application ID of RimWorld, whose workshop we download from
pub const WORKSHOP_APP_ID: &str = "294100";

/// No output at all for this long: report "still connecting"
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Silence after output started for this long: report a stall
pub const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Total runtime cap for one download
pub const HARD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Time allowed between SIGTERM and SIGKILL
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Timer settings for one download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SteamCmdTimeouts {
    pub connect: Duration,
    pub activity: Duration,
    pub hard: Duration,
    pub grace: Duration,
}

impl Default for SteamCmdTimeouts {
    fn default() -> Self {
        Self {
            connect: CONNECT_TIMEOUT,
            activity: ACTIVITY_TIMEOUT,
            hard: HARD_TIMEOUT,
            grace: KILL_GRACE,
        }
    }
}

/// SteamCMD errors
#[derive(Debug, Error)]
pub enum SteamCmdError {
    #[error("SteamCMD not found at: {0}")]
    NotFound(PathBuf),

    #[error("A download is already in progress (mod {0})")]
    Busy(String),

    #[error("Failed to start SteamCMD: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to read SteamCMD output: {0}")]
    Io(#[source] std::io::Error),

    #[error("{0}")]
    Failed(String),

    #[error("Download timeout after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Download cancelled by user")]
    Cancelled,
}

impl SteamCmdError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SteamCmdError::NotFound(_) => ErrorKind::Configuration,
            SteamCmdError::Busy(_) => ErrorKind::Busy,
            SteamCmdError::Spawn(_) | SteamCmdError::Io(_) | SteamCmdError::Failed(_) => {
                ErrorKind::Process
            }
            SteamCmdError::Timeout(_) => ErrorKind::Timeout,
            SteamCmdError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SteamCmdError::Cancelled)
    }
}

/// A finished tool download, still in the staging directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDownload {
    pub item_id: String,
    pub staging_path: PathBuf,
}

/// The download-tool seam used by the orchestrator
#[async_trait]
pub trait DownloadTool: Send + Sync {
    /// Download one item into the staging directory
    async fn download_item(&self, item_id: &str) -> Result<ToolDownload, SteamCmdError>;

    /// Cancel the active download. Returns true iff one was in flight.
    fn cancel(&self) -> bool;

    fn is_downloading(&self) -> bool;

    fn current_item(&self) -> Option<String>;

    /// Receive progress events until the guard is dropped
    fn subscribe(&self, listener: ProgressListener) -> Subscription;
}

/// State of the single in-flight download
struct ActiveDownload {
    item_id: String,
    cancel: CancellationToken,
}

/// Clears the active slot when a download ends, however it ends
struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<ActiveDownload>>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// SteamCMD process adapter
pub struct SteamCmd {
    config: Arc<dyn ConfigProvider>,
    parser: Box<dyn ProgressParser>,
    timeouts: SteamCmdTimeouts,
    hub: ProgressHub,
    active: Mutex<Option<ActiveDownload>>,
}

impl SteamCmd {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            config,
            parser: Box::new(SteamCmdParser),
            timeouts: SteamCmdTimeouts::default(),
            hub: ProgressHub::new(),
            active: Mutex::new(None),
        }
    }

    pub fn with_timeouts(mut self, timeouts: SteamCmdTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_parser(mut self, parser: impl ProgressParser + 'static) -> Self {
        self.parser = Box::new(parser);
        self
    }

    /// Resolve the configured executable, failing fast if it does not exist
    pub fn validate(&self) -> Result<PathBuf, SteamCmdError> {
        resolve_executable(&self.config.steamcmd_executable())
    }

    fn begin(&self, item_id: &str) -> Result<(ActiveGuard<'_>, CancellationToken), SteamCmdError> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = slot.as_ref() {
            return Err(SteamCmdError::Busy(active.item_id.clone()));
        }
        let token = CancellationToken::new();
        *slot = Some(ActiveDownload {
            item_id: item_id.to_string(),
            cancel: token.clone(),
        });
        Ok((ActiveGuard { slot: &self.active }, token))
    }

    fn emit(&self, progress: DownloadProgress) {
        self.hub.emit(&progress);
    }

    async fn run(
        &self,
        executable: &Path,
        item_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolDownload, SteamCmdError> {
        let timeouts = self.timeouts;
        let args = command_args(item_id);

        info!("Starting SteamCMD download for mod {}", item_id);
        debug!("Command: {} {}", executable.display(), args.join(" "));

        self.emit(
            DownloadProgress::new(ProgressStage::Connecting, 0)
                .with_message("Connecting to Steam..."),
        );

        let mut child = Command::new(executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SteamCmdError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SteamCmdError::Failed("Missing stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SteamCmdError::Failed("Missing stderr".to_string()))?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();

        let mut stdout_text = String::new();
        let mut stderr_text = String::new();
        let mut stdout_open = true;
        let mut stderr_open = true;

        let mut saw_output = false;
        let mut saw_progress = false;
        let mut connect_reported = false;
        let mut stall_reported = false;
        let mut last_percent = 0;
        let mut last_activity = Instant::now();

        let hard_deadline = sleep(timeouts.hard);
        tokio::pin!(hard_deadline);
        let connect_timer = sleep(timeouts.connect);
        tokio::pin!(connect_timer);

        let status = loop {
            let stall_at = last_activity + timeouts.activity;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Cancelling SteamCMD download for mod {}", item_id);
                    terminate(&mut child, timeouts.grace).await;
                    return Err(SteamCmdError::Cancelled);
                }

                _ = &mut hard_deadline => {
                    warn!(
                        "SteamCMD download for mod {} timed out after {}s",
                        item_id,
                        timeouts.hard.as_secs()
                    );
                    terminate(&mut child, timeouts.grace).await;
                    let err = SteamCmdError::Timeout(timeouts.hard);
                    self.emit(DownloadProgress::new(ProgressStage::Error, 0).with_message(err.to_string()));
                    return Err(err);
                }

                line = out_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        saw_output = true;
                        stall_reported = false;
                        last_activity = Instant::now();

                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        debug!("[steamcmd] {}", trimmed);
                        stdout_text.push_str(trimmed);
                        stdout_text.push('\n');

                        if let Some(mut progress) = self.parser.parse_line(trimmed) {
                            saw_progress = true;
                            // Relayed percents never go backwards within one run
                            progress.percent = progress.percent.max(last_percent);
                            last_percent = progress.percent;
                            self.emit(progress);
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!("Failed to read SteamCMD stdout: {}", e);
                        stdout_open = false;
                    }
                },

                line = err_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        saw_output = true;
                        stall_reported = false;
                        last_activity = Instant::now();
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            warn!("[steamcmd stderr] {}", trimmed);
                            stderr_text.push_str(trimmed);
                            stderr_text.push('\n');
                        }
                    }
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!("Failed to read SteamCMD stderr: {}", e);
                        stderr_open = false;
                    }
                },

                status = child.wait(), if !stdout_open && !stderr_open => {
                    break status.map_err(SteamCmdError::Io)?;
                }

                _ = &mut connect_timer, if !saw_output && !connect_reported => {
                    connect_reported = true;
                    warn!(
                        "No output from SteamCMD after {}s, still connecting",
                        timeouts.connect.as_secs()
                    );
                    self.emit(
                        DownloadProgress::new(ProgressStage::Connecting, 0)
                            .with_message("Still connecting to Steam..."),
                    );
                }

                _ = sleep_until(stall_at), if saw_output && !stall_reported => {
                    stall_reported = true;
                    warn!(
                        "SteamCMD silent for {}s on mod {}",
                        timeouts.activity.as_secs(),
                        item_id
                    );
                    self.emit(DownloadProgress::stalled(format!(
                        "No output for {} seconds",
                        timeouts.activity.as_secs()
                    )));
                }
            }
        };

        info!("SteamCMD exited with {}", status);

        // A cancel that raced natural completion still wins
        if cancel.is_cancelled() {
            return Err(SteamCmdError::Cancelled);
        }

        match parser::judge(status.code(), &stdout_text, &stderr_text, saw_progress) {
            Verdict::Success => Ok(ToolDownload {
                item_id: item_id.to_string(),
                staging_path: self.config.steamcmd_download_dir().join(item_id),
            }),
            Verdict::Failed(message) => {
                warn!("SteamCMD download for mod {} failed: {}", item_id, message);
                self.emit(DownloadProgress::new(ProgressStage::Error, 0).with_message(message.clone()));
                Err(SteamCmdError::Failed(message))
            }
        }
    }
}

#[async_trait]
impl DownloadTool for SteamCmd {
    async fn download_item(&self, item_id: &str) -> Result<ToolDownload, SteamCmdError> {
        let executable = self.validate()?;
        let (_guard, cancel) = self.begin(item_id)?;
        self.run(&executable, item_id, &cancel).await
    }

    fn cancel(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(active) if !active.cancel.is_cancelled() => {
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn is_downloading(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current_item(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.item_id.clone())
    }

    fn subscribe(&self, listener: ProgressListener) -> Subscription {
        self.hub.subscribe(listener)
    }
}

/// Fixed SteamCMD argument template for one item
pub fn command_args(item_id: &str) -> Vec<String> {
    [
        "+login",
        "anonymous",
        "+workshop_download_item",
        WORKSHOP_APP_ID,
        item_id,
        "+quit",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Resolve a configured executable.
///
/// A bare program name is looked up on PATH; anything else must exist.
pub fn resolve_executable(path: &Path) -> Result<PathBuf, SteamCmdError> {
    if path.as_os_str().is_empty() {
        return Err(SteamCmdError::NotFound(path.to_path_buf()));
    }
    if path.components().count() == 1 && !path.exists() {
        return which::which(path).map_err(|_| SteamCmdError::NotFound(path.to_path_buf()));
    }
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(SteamCmdError::NotFound(path.to_path_buf()))
    }
}

/// Ask the process to stop, then force-kill it after `grace`
async fn terminate(child: &mut Child, grace: Duration) {
    send_terminate(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("SteamCMD exited after terminate"),
        Err(_) => {
            warn!("SteamCMD did not exit gracefully, forcing kill");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill SteamCMD: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        debug!("SteamCMD already exited");
        return;
    };
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => debug!("Sent SIGTERM to SteamCMD (pid {})", pid),
        // Exited between the id() check and the signal
        Err(Errno::ESRCH) => debug!("SteamCMD already exited"),
        Err(e) => {
            warn!("Failed to send SIGTERM to SteamCMD: {}", e);
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Settings, SettingsStore};
    use tempfile::TempDir;

    #[test]
    fn test_command_args() {
        assert_eq!(
            command_args("2009463077"),
            vec![
                "+login",
                "anonymous",
                "+workshop_download_item",
                "294100",
                "2009463077",
                "+quit"
            ]
        );
    }

    #[test]
    fn test_resolve_missing_executable() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("steamcmd.sh");
        assert!(matches!(
            resolve_executable(&missing),
            Err(SteamCmdError::NotFound(p)) if p == missing
        ));
        assert!(resolve_executable(Path::new("")).is_err());
        assert!(resolve_executable(Path::new("definitely-not-a-real-steamcmd-binary")).is_err());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(SteamCmdError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            SteamCmdError::Timeout(HARD_TIMEOUT).to_string(),
            "Download timeout after 300 seconds"
        );
        assert_eq!(SteamCmdError::Timeout(HARD_TIMEOUT).kind(), ErrorKind::Timeout);
        assert_eq!(
            SteamCmdError::NotFound(PathBuf::from("x")).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(SteamCmdError::Busy("1".into()).kind(), ErrorKind::Busy);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_fast() {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.steamcmd.executable_path = temp.path().join("nope.sh");
        let tool = SteamCmd::new(Arc::new(SettingsStore::in_memory(settings)));

        let err = tool.download_item("1").await.unwrap_err();
        assert!(matches!(err, SteamCmdError::NotFound(_)));
        assert!(!tool.is_downloading());
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::{AtomicUsize, Ordering};

        /// Write a fake steamcmd script. `$5` is the workshop item ID.
        fn fake_steamcmd(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("steamcmd.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn tool_for(temp: &TempDir, body: &str, timeouts: SteamCmdTimeouts) -> Arc<SteamCmd> {
            let mut settings = Settings::default();
            settings.steamcmd.executable_path = fake_steamcmd(temp.path(), body);
            settings.steamcmd.download_path = temp.path().join("staging");
            let config = Arc::new(SettingsStore::in_memory(settings));
            Arc::new(SteamCmd::new(config).with_timeouts(timeouts))
        }

        fn record(tool: &SteamCmd) -> (Subscription, Arc<Mutex<Vec<DownloadProgress>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let sub = tool.subscribe(Arc::new(move |p: &DownloadProgress| {
                sink.lock().unwrap().push(p.clone());
            }));
            (sub, seen)
        }

        fn fast_timeouts() -> SteamCmdTimeouts {
            SteamCmdTimeouts {
                connect: Duration::from_secs(10),
                activity: Duration::from_secs(10),
                hard: Duration::from_secs(20),
                grace: Duration::from_millis(500),
            }
        }

        async fn wait_until_active(tool: &SteamCmd) {
            for _ in 0..200 {
                if tool.is_downloading() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("download never became active");
        }

        #[tokio::test]
        async fn test_successful_download() {
            let temp = TempDir::new().unwrap();
            let tool = tool_for(
                &temp,
                "echo 'Loading Steam API...OK'\n\
                 echo 'Downloading update (50 of 100)'\n\
                 echo 'Downloading update (100 of 100)'\n\
                 echo \"Success. Downloaded item $5\"\n\
                 exit 0",
                fast_timeouts(),
            );
            let (_sub, seen) = record(&tool);

            let result = tool.download_item("111").await.unwrap();
            assert_eq!(result.item_id, "111");
            assert_eq!(result.staging_path, temp.path().join("staging").join("111"));
            assert!(!tool.is_downloading());
            assert_eq!(tool.current_item(), None);

            let events = seen.lock().unwrap();
            let summary: Vec<_> = events.iter().map(|p| (p.stage, p.percent)).collect();
            assert_eq!(
                summary,
                vec![
                    (ProgressStage::Connecting, 0),
                    (ProgressStage::Downloading, 50),
                    (ProgressStage::Downloading, 100),
                ]
            );
        }

        #[tokio::test]
        async fn test_progress_never_decreases() {
            let temp = TempDir::new().unwrap();
            let tool = tool_for(
                &temp,
                "echo 'Downloading update (60 of 100)'\n\
                 echo 'Downloading update (10 of 200)'\n\
                 echo 'Downloading update (200 of 200)'\n\
                 echo 'Success. Downloaded item'",
                fast_timeouts(),
            );
            let (_sub, seen) = record(&tool);
            tool.download_item("5").await.unwrap();

            let percents: Vec<i32> = seen
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.stage == ProgressStage::Downloading)
                .map(|p| p.percent)
                .collect();
            assert_eq!(percents, vec![60, 60, 100]);
        }

        #[tokio::test]
        async fn test_exit_zero_with_error_phrase_fails() {
            let temp = TempDir::new().unwrap();
            let tool = tool_for(
                &temp,
                "echo 'ERROR! Download item 9 failed (Failure).'\nexit 0",
                fast_timeouts(),
            );
            let err = tool.download_item("9").await.unwrap_err();
            assert!(matches!(err, SteamCmdError::Failed(ref m) if m.starts_with("ERROR!")));
            assert_eq!(err.kind(), ErrorKind::Process);
        }

        #[tokio::test]
        async fn test_nonzero_exit_fails() {
            let temp = TempDir::new().unwrap();
            let tool = tool_for(&temp, "echo 'Success. Downloaded item'\nexit 3", fast_timeouts());
            let err = tool.download_item("9").await.unwrap_err();
            assert_eq!(err.to_string(), "Process exited with code 3");
        }

        #[tokio::test]
        async fn test_second_download_rejected_while_active() {
            let temp = TempDir::new().unwrap();
            let marker = temp.path().join("spawn-count");
            let body = format!(
                "echo run >> '{}'\necho 'Downloading update (1 of 2)'\nexec sleep 30",
                marker.display()
            );
            let tool = tool_for(&temp, &body, fast_timeouts());

            let first = {
                let tool = Arc::clone(&tool);
                tokio::spawn(async move { tool.download_item("1").await })
            };
            wait_until_active(&tool).await;
            assert_eq!(tool.current_item().as_deref(), Some("1"));

            let second = tool.download_item("2").await;
            assert!(matches!(second, Err(SteamCmdError::Busy(ref id)) if id == "1"));

            assert!(tool.cancel());
            let first = first.await.unwrap();
            assert!(matches!(first, Err(SteamCmdError::Cancelled)));

            let runs = std::fs::read_to_string(&marker).unwrap_or_default();
            assert_eq!(runs.lines().count(), 1);
        }

        #[tokio::test]
        async fn test_terminate_sends_sigterm_first() {
            let temp = TempDir::new().unwrap();
            let marker = temp.path().join("got-term");
            let script = fake_steamcmd(
                temp.path(),
                &format!(
                    "trap 'touch {}; exit 0' TERM\necho ready\nwhile true; do sleep 0.05; done",
                    marker.display()
                ),
            );
            let mut child = Command::new(&script)
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            let stdout = child.stdout.take().unwrap();
            let mut lines = BufReader::new(stdout).lines();
            assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));

            terminate(&mut child, Duration::from_secs(5)).await;
            assert!(marker.exists(), "script should see SIGTERM before any kill");

            // Signalling a reaped child is a no-op
            terminate(&mut child, Duration::from_millis(100)).await;
        }

        #[tokio::test]
        async fn test_cancel_without_download() {
            let temp = TempDir::new().unwrap();
            let tool = tool_for(&temp, "exit 0", fast_timeouts());
            assert!(!tool.cancel());
        }

        #[tokio::test]
        async fn test_hard_timeout_kills_process() {
            let temp = TempDir::new().unwrap();
            let tool = tool_for(
                &temp,
                "echo 'Connecting...'\nexec sleep 30",
                SteamCmdTimeouts {
                    hard: Duration::from_millis(500),
                    ..fast_timeouts()
                },
            );
            let (_sub, seen) = record(&tool);

            let started = std::time::Instant::now();
            let err = tool.download_item("3").await.unwrap_err();
            assert!(matches!(err, SteamCmdError::Timeout(_)));
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!tool.is_downloading());
            assert!(seen
                .lock()
                .unwrap()
                .iter()
                .any(|p| p.stage == ProgressStage::Error));
        }

        #[tokio::test]
        async fn test_advisory_timers_do_not_kill() {
            let temp = TempDir::new().unwrap();
            let tool = tool_for(
                &temp,
                "sleep 1\necho 'Downloading update (10 of 100)'\nsleep 1\n\
                 echo 'Success. Downloaded item'",
                SteamCmdTimeouts {
                    connect: Duration::from_millis(300),
                    activity: Duration::from_millis(300),
                    ..fast_timeouts()
                },
            );
            let stalls = Arc::new(AtomicUsize::new(0));
            let connecting = Arc::new(AtomicUsize::new(0));
            let _sub = {
                let stalls = Arc::clone(&stalls);
                let connecting = Arc::clone(&connecting);
                tool.subscribe(Arc::new(move |p: &DownloadProgress| {
                    if p.is_stalled() {
                        stalls.fetch_add(1, Ordering::SeqCst);
                    }
                    if p.stage == ProgressStage::Connecting {
                        connecting.fetch_add(1, Ordering::SeqCst);
                    }
                }))
            };

            tool.download_item("4").await.unwrap();
            assert_eq!(stalls.load(Ordering::SeqCst), 1);
            // Initial event plus the "still connecting" diagnostic
            assert_eq!(connecting.load(Ordering::SeqCst), 2);
        }
    }
}
