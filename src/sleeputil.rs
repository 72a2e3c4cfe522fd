// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implement common functions and definitions used throughout the app and library.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};
use thiserror::Error as ThisError;

/// Path of the kernel command line, relative to the system root.
pub const PROC_CMDLINE: &str = "proc/cmdline";

/// Key on the kernel command line that overrides the computed resume offset.
const RESUME_OFFSET_KEY: &str = "resume_offset";

#[derive(Debug, ThisError)]
pub enum SleepError {
    /// Sleep policy is missing or malformed.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    /// The requested verb is disabled by the sleep policy.
    #[error("Sleep mode \"{0}\" is disabled by configuration, refusing")]
    VerbDisabled(SleepVerb),
    /// The hibernation location cannot be expressed to the kernel.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// A file needed for the transition could not be opened or queried.
    #[error("{0}: {1}")]
    ResourceUnavailable(String, std::io::Error),
    /// The power control file could not be opened.
    #[error("Failed to open {0}: {1}")]
    CannotOpenControl(String, std::io::Error),
    /// No swap space is active.
    #[error("No swap partitions or files were found")]
    NoSwapError(),
    /// The hibernation target has no allocated data.
    #[error("No extents found in '{0}'")]
    NoExtents(String),
    /// Error getting the fiemap.
    #[error("Error getting the fiemap: {0}")]
    FiemapError(nix::Error),
    /// The fiemap changed between queries.
    #[error("Invalid fiemap: {0}")]
    InvalidFiemapError(String),
    /// A control file rejected a token.
    #[error("Failed to write '{token}' to {path}: {source}")]
    ControlWriteError {
        path: String,
        token: String,
        source: std::io::Error,
    },
    /// Wake timer error.
    #[error("Wake timer error: {0}")]
    TimerError(nix::Error),
    /// Both the delayed hibernation and the fallback suspend failed.
    #[error("Could neither hibernate nor suspend again")]
    TransitionFailed(),
}

/// The flavor of sleep requested by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepVerb {
    Suspend,
    Hibernate,
    HybridSleep,
    SuspendThenHibernate,
}

impl SleepVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepVerb::Suspend => "suspend",
            SleepVerb::Hibernate => "hibernate",
            SleepVerb::HybridSleep => "hybrid-sleep",
            SleepVerb::SuspendThenHibernate => "suspend-then-hibernate",
        }
    }
}

impl fmt::Display for SleepVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SleepVerb {
    type Err = SleepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suspend" => Ok(SleepVerb::Suspend),
            "hibernate" => Ok(SleepVerb::Hibernate),
            "hybrid-sleep" => Ok(SleepVerb::HybridSleep),
            "suspend-then-hibernate" => Ok(SleepVerb::SuspendThenHibernate),
            _ => Err(SleepError::ConfigurationError(format!(
                "Unknown command '{}'",
                s
            ))),
        }
    }
}

/// Options for one sleep invocation.
#[derive(Clone, Debug)]
pub struct SleepOptions {
    pub verb: SleepVerb,
    /// Main config file. Drop-ins are read from the directory with ".d"
    /// appended to this path.
    pub config_path: PathBuf,
}

/// Get the page size on this system.
pub fn get_page_size() -> usize {
    // Safe because sysconf() returns a long and has no other side effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Read the kernel command line below the given system root. Only the resume
/// offset override comes from there, so an unreadable command line is treated
/// as an empty one.
pub fn read_kernel_cmdline(root: &Path) -> String {
    let path = root.join(PROC_CMDLINE);
    match fs::read_to_string(&path) {
        Ok(cmdline) => cmdline,
        Err(e) => {
            warn!(
                "Unable to read {}, assuming no resume offset: {}",
                path.display(),
                e
            );
            String::new()
        }
    }
}

/// Split a kernel command line into words. Double quotes group whitespace
/// into a single word and are dropped from the result.
fn split_cmdline(cmdline: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut quoted = false;
    let mut in_word = false;

    for c in cmdline.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                word.push(c);
                in_word = true;
            }
        }
    }

    if in_word {
        words.push(word);
    }

    words
}

/// Find the resume offset override on the kernel command line, if any. The
/// last occurrence wins, like the kernel's own parsing.
pub fn parse_resume_offset(cmdline: &str) -> Option<String> {
    let mut offset = None;
    for word in split_cmdline(cmdline) {
        let (key, value) = match word.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (word.as_str(), None),
        };

        if key != RESUME_OFFSET_KEY {
            continue;
        }

        match value {
            Some(value) if !value.is_empty() => {
                debug!("\"{}\" kernel command line set with {}", key, value);
                offset = Some(value.to_string());
            }
            _ => warn!(
                "\"{}\" kernel command line specified with no value; ignoring",
                key
            ),
        }
    }

    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_round_trip() {
        for verb in [
            SleepVerb::Suspend,
            SleepVerb::Hibernate,
            SleepVerb::HybridSleep,
            SleepVerb::SuspendThenHibernate,
        ] {
            assert_eq!(verb.as_str().parse::<SleepVerb>().unwrap(), verb);
        }
    }

    #[test]
    fn test_unknown_verb() {
        let err = "hibernate-then-suspend".parse::<SleepVerb>().unwrap_err();
        assert!(matches!(err, SleepError::ConfigurationError(_)));
    }

    #[test]
    fn test_parse_resume_offset_absent() {
        assert_eq!(parse_resume_offset("root=/dev/sda3 ro quiet\n"), None);
    }

    #[test]
    fn test_parse_resume_offset_present() {
        let cmdline = "root=/dev/sda3 resume=/dev/sda3 resume_offset=34816 quiet\n";
        assert_eq!(parse_resume_offset(cmdline), Some("34816".to_string()));
    }

    #[test]
    fn test_parse_resume_offset_last_wins() {
        let cmdline = "resume_offset=1 resume_offset=2";
        assert_eq!(parse_resume_offset(cmdline), Some("2".to_string()));
    }

    #[test]
    fn test_parse_resume_offset_missing_value() {
        assert_eq!(parse_resume_offset("resume_offset quiet"), None);
        assert_eq!(parse_resume_offset("resume_offset= quiet"), None);
        // A valueless occurrence does not clear an earlier one.
        assert_eq!(
            parse_resume_offset("resume_offset=7 resume_offset"),
            Some("7".to_string())
        );
    }

    #[test]
    fn test_parse_resume_offset_ignores_initrd_keys() {
        assert_eq!(parse_resume_offset("rd.resume_offset=5"), None);
    }

    #[test]
    fn test_split_cmdline_quotes() {
        let words = split_cmdline("a \"b c\" d=\"e f\"  g");
        assert_eq!(words, vec!["a", "b c", "d=e f", "g"]);
    }

    #[test]
    fn test_read_kernel_cmdline() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_kernel_cmdline(dir.path()), "");
        assert_eq!(parse_resume_offset(&read_kernel_cmdline(dir.path())), None);

        fs::create_dir(dir.path().join("proc")).unwrap();
        fs::write(dir.path().join(PROC_CMDLINE), "ro resume_offset=77\n").unwrap();
        assert_eq!(
            parse_resume_offset(&read_kernel_cmdline(dir.path())),
            Some("77".to_string())
        );
    }
}
