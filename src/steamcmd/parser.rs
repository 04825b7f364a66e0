//! SteamCMD output parsing
//!
//! SteamCMD has no machine-readable output, so progress and the final
//! verdict are recovered from its console text. Everything here is pure so
//! it can be tested against captured output.

use regex::Regex;
use std::sync::OnceLock;

use crate::types::{DownloadProgress, ProgressStage};

/// Phrases SteamCMD prints when an item landed on disk
const SUCCESS_PHRASES: &[&str] = &["Success. Downloaded item", "Downloaded item"];

/// Turns one raw output line into a progress event, if it carries one
pub trait ProgressParser: Send + Sync {
    fn parse_line(&self, line: &str) -> Option<DownloadProgress>;
}

/// Parser for `Downloading update (X of Y)` lines
#[derive(Debug, Default, Clone, Copy)]
pub struct SteamCmdParser;

impl ProgressParser for SteamCmdParser {
    fn parse_line(&self, line: &str) -> Option<DownloadProgress> {
        static PROGRESS_RE: OnceLock<Regex> = OnceLock::new();
        let re = PROGRESS_RE.get_or_init(|| {
            Regex::new(r"(?i)downloading update \((\d+) of (\d+)\)").expect("valid progress regex")
        });

        let caps = re.captures(line)?;
        let current: u64 = caps.get(1)?.as_str().parse().ok()?;
        let total: u64 = caps.get(2)?.as_str().parse().ok()?;
        let percent = percent_of(current, total);

        Some(
            DownloadProgress::new(ProgressStage::Downloading, percent)
                .with_counts(current, total)
                .with_message(format!(
                    "Downloading: {}% ({} of {})",
                    percent, current, total
                )),
        )
    }
}

/// Rounded percentage, clamped to 0-100. An empty update counts as done.
pub fn percent_of(current: u64, total: u64) -> i32 {
    if total == 0 {
        return 100;
    }
    let pct = (current as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as i32
}

/// Final judgement over a finished SteamCMD run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failed(String),
}

/// Decide whether a run succeeded.
///
/// SteamCMD can exit 0 on failure, so success needs a success phrase (or
/// observed progress), no error phrase, and exit code 0.
pub fn judge(exit_code: Option<i32>, stdout: &str, stderr: &str, saw_progress: bool) -> Verdict {
    let has_success = saw_progress || SUCCESS_PHRASES.iter().any(|p| stdout.contains(p));
    let has_error =
        stdout.contains("ERROR") || stdout.contains("Failure") || stderr.contains("ERROR");

    if exit_code == Some(0) && has_success && !has_error {
        return Verdict::Success;
    }

    let message = if has_error {
        error_line(stdout)
            .or_else(|| error_line(stderr))
            .or_else(|| failure_line(stdout))
            .unwrap_or_else(|| "Download failed".to_string())
    } else if exit_code != Some(0) {
        match exit_code {
            Some(code) => format!("Process exited with code {}", code),
            None => "Process terminated by signal".to_string(),
        }
    } else {
        "Download may have failed. Check SteamCMD output.".to_string()
    };

    Verdict::Failed(message)
}

/// First `ERROR...` fragment in `text`, up to the end of its line
fn error_line(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        line.find("ERROR")
            .map(|idx| line[idx..].trim_end().to_string())
    })
}

fn failure_line(text: &str) -> Option<String> {
    text.lines()
        .find(|line| line.contains("Failure"))
        .map(|line| line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Trimmed capture of a real SteamCMD session
    const CAPTURED_SUCCESS: &str = "\
Redirecting stderr to '/home/user/Steam/logs/stderr.txt'
Loading Steam API...OK
Connecting anonymously to Steam Public...OK
Waiting for client config...OK
Waiting for user info...OK
Downloading item 2009463077 ...
Downloading update (1,024 of 2,048 KB)...
Success. Downloaded item 2009463077 to \"/home/user/steamcmd/steamapps/workshop/content/294100/2009463077\" (2048 bytes)
";

    #[test]
    fn test_parse_progress_line() {
        let p = SteamCmdParser
            .parse_line("Downloading update (50 of 100)")
            .unwrap();
        assert_eq!(p.stage, ProgressStage::Downloading);
        assert_eq!(p.percent, 50);
        assert_eq!(p.current, Some(50));
        assert_eq!(p.total, Some(100));
    }

    #[test]
    fn test_parse_is_case_insensitive_and_embedded() {
        let p = SteamCmdParser
            .parse_line("  [2024] downloading Update (1 of 3) ...")
            .unwrap();
        assert_eq!(p.percent, 33);
    }

    #[test]
    fn test_non_matching_lines_ignored() {
        assert!(SteamCmdParser.parse_line("Loading Steam API...OK").is_none());
        assert!(SteamCmdParser.parse_line("").is_none());
        // Thousands separators are not the (X of Y) shape
        assert!(SteamCmdParser
            .parse_line("Downloading update (1,024 of 2,048 KB)...")
            .is_none());
    }

    #[test]
    fn test_zero_of_zero_is_complete() {
        let p = SteamCmdParser.parse_line("Downloading update (0 of 0)").unwrap();
        assert_eq!(p.percent, 100);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 100), 0);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 67);
        assert_eq!(percent_of(150, 100), 100);
    }

    #[test]
    fn test_judge_success() {
        assert_eq!(judge(Some(0), CAPTURED_SUCCESS, "", false), Verdict::Success);
    }

    #[test]
    fn test_exit_zero_alone_is_not_success() {
        let verdict = judge(Some(0), "Loading Steam API...OK\n", "", false);
        assert!(matches!(verdict, Verdict::Failed(msg) if msg.contains("may have failed")));
    }

    #[test]
    fn test_error_phrase_beats_exit_zero() {
        let out = "Downloading item 1 ...\nERROR! Download item 1 failed (File Not Found).\n";
        assert_eq!(
            judge(Some(0), out, "", true),
            Verdict::Failed("ERROR! Download item 1 failed (File Not Found).".to_string())
        );
    }

    #[test]
    fn test_failure_phrase() {
        let out = "Downloaded item 5\nLogin Failure: No Connection\n";
        assert_eq!(
            judge(Some(0), out, "", false),
            Verdict::Failed("Login Failure: No Connection".to_string())
        );
    }

    #[test]
    fn test_stderr_error() {
        assert_eq!(
            judge(Some(0), "Success. Downloaded item 5", "ERROR: disk full", false),
            Verdict::Failed("ERROR: disk full".to_string())
        );
    }

    #[test]
    fn test_nonzero_exit() {
        assert_eq!(
            judge(Some(8), "Success. Downloaded item 5", "", false),
            Verdict::Failed("Process exited with code 8".to_string())
        );
        assert_eq!(
            judge(None, "", "", false),
            Verdict::Failed("Process terminated by signal".to_string())
        );
    }
}
