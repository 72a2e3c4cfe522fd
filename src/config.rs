// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Read the sleep policy from the system.
//!
//! The main file is merged with every drop-in from the `.d` directory next to
//! it, in file name order. Keys set in a later file replace earlier values.
//!
//! # Example config
//! ```toml
//! [sleep]
//! allow_hybrid_sleep = false
//! suspend_state = ["mem"]
//! hibernate_delay_sec = 3600
//!
//! [hooks]
//! timeout_sec = 30
//! ```

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;

use crate::sleeputil::{SleepError, SleepVerb};

/// Default location of the main config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sleepman/sleep.toml";

const DEFAULT_HOOK_DIRS: [&str; 2] = [
    "/etc/sleepman/system-sleep",
    "/usr/lib/sleepman/system-sleep",
];
const DEFAULT_HOOK_TIMEOUT_SEC: u64 = 90;
const DEFAULT_HIBERNATE_DELAY_SEC: u64 = 180 * 60;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSleepSection {
    allow_suspend: Option<bool>,
    allow_hibernation: Option<bool>,
    allow_hybrid_sleep: Option<bool>,
    allow_suspend_then_hibernate: Option<bool>,
    suspend_mode: Option<Vec<String>>,
    suspend_state: Option<Vec<String>>,
    hibernate_mode: Option<Vec<String>>,
    hibernate_state: Option<Vec<String>>,
    hybrid_sleep_mode: Option<Vec<String>>,
    hybrid_sleep_state: Option<Vec<String>>,
    hibernate_delay_sec: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHookSection {
    directories: Option<Vec<PathBuf>>,
    timeout_sec: Option<u64>,
}

/// A single config file as written on disk. Every key is optional so that
/// drop-ins only override what they mention.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    sleep: RawSleepSection,
    #[serde(default)]
    hooks: RawHookSection,
}

macro_rules! overlay {
    ($dst:expr, $src:expr, $($field:ident),+) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl RawConfig {
    fn merge(&mut self, other: RawConfig) {
        overlay!(
            self.sleep,
            other.sleep,
            allow_suspend,
            allow_hibernation,
            allow_hybrid_sleep,
            allow_suspend_then_hibernate,
            suspend_mode,
            suspend_state,
            hibernate_mode,
            hibernate_state,
            hybrid_sleep_mode,
            hybrid_sleep_state,
            hibernate_delay_sec
        );
        overlay!(self.hooks, other.hooks, directories, timeout_sec);
    }

    /// Fill in defaults for everything no file mentioned.
    fn resolve(self) -> SleepConfig {
        let sleep = self.sleep;
        let allow_suspend = sleep.allow_suspend.unwrap_or(true);
        let allow_hibernation = sleep.allow_hibernation.unwrap_or(true);
        let both = allow_suspend && allow_hibernation;

        SleepConfig {
            allow_suspend,
            allow_hibernation,
            allow_hybrid_sleep: sleep.allow_hybrid_sleep.unwrap_or(both),
            allow_suspend_then_hibernate: sleep.allow_suspend_then_hibernate.unwrap_or(both),
            suspend_modes: sleep.suspend_mode.unwrap_or_default(),
            suspend_states: sleep
                .suspend_state
                .unwrap_or_else(|| strings(&["mem", "standby", "freeze"])),
            hibernate_modes: sleep
                .hibernate_mode
                .unwrap_or_else(|| strings(&["platform", "shutdown"])),
            hibernate_states: sleep.hibernate_state.unwrap_or_else(|| strings(&["disk"])),
            hybrid_sleep_modes: sleep
                .hybrid_sleep_mode
                .unwrap_or_else(|| strings(&["suspend", "platform", "shutdown"])),
            hybrid_sleep_states: sleep
                .hybrid_sleep_state
                .unwrap_or_else(|| strings(&["disk"])),
            hibernate_delay: Duration::from_secs(
                sleep
                    .hibernate_delay_sec
                    .unwrap_or(DEFAULT_HIBERNATE_DELAY_SEC),
            ),
            hook_dirs: self
                .hooks
                .directories
                .unwrap_or_else(|| DEFAULT_HOOK_DIRS.iter().map(PathBuf::from).collect()),
            hook_timeout: Duration::from_secs(
                self.hooks.timeout_sec.unwrap_or(DEFAULT_HOOK_TIMEOUT_SEC),
            ),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// The resolved sleep policy.
#[derive(Clone, Debug, PartialEq)]
pub struct SleepConfig {
    pub allow_suspend: bool,
    pub allow_hibernation: bool,
    pub allow_hybrid_sleep: bool,
    pub allow_suspend_then_hibernate: bool,
    pub suspend_modes: Vec<String>,
    pub suspend_states: Vec<String>,
    pub hibernate_modes: Vec<String>,
    pub hibernate_states: Vec<String>,
    pub hybrid_sleep_modes: Vec<String>,
    pub hybrid_sleep_states: Vec<String>,
    pub hibernate_delay: Duration,
    pub hook_dirs: Vec<PathBuf>,
    pub hook_timeout: Duration,
}

impl Default for SleepConfig {
    fn default() -> Self {
        RawConfig::default().resolve()
    }
}

impl SleepConfig {
    fn validate(&self) -> Result<()> {
        if self.hibernate_delay.is_zero() {
            return Err(SleepError::ConfigurationError(
                "hibernate_delay_sec must be greater than zero".to_string(),
            )
            .into());
        }

        if self.hook_timeout.is_zero() {
            return Err(SleepError::ConfigurationError(
                "hooks timeout_sec must be greater than zero".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Look up whether a verb is allowed and which disk modes and power states
    /// it uses. Suspend-then-hibernate reports its suspend half here; the
    /// hibernate half is looked up through `Hibernate`.
    pub fn sleep_settings(&self, verb: SleepVerb) -> (bool, &[String], &[String]) {
        match verb {
            SleepVerb::Suspend => (
                self.allow_suspend,
                &self.suspend_modes,
                &self.suspend_states,
            ),
            SleepVerb::Hibernate => (
                self.allow_hibernation,
                &self.hibernate_modes,
                &self.hibernate_states,
            ),
            SleepVerb::HybridSleep => (
                self.allow_hybrid_sleep,
                &self.hybrid_sleep_modes,
                &self.hybrid_sleep_states,
            ),
            SleepVerb::SuspendThenHibernate => (
                self.allow_suspend_then_hibernate,
                &self.suspend_modes,
                &self.suspend_states,
            ),
        }
    }
}

fn drop_in_dir(config_file: &Path) -> PathBuf {
    let mut dir = config_file.as_os_str().to_os_string();
    dir.push(".d");
    PathBuf::from(dir)
}

fn find_drop_in_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(iter) => iter
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().unwrap_or(OsStr::new("")) == "toml")
            .collect(),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to get dir listing for {}: {err}", dir.display());
            }
            return Vec::new();
        }
    };

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    files
}

fn read_config(config_file: &Path) -> Result<RawConfig> {
    let contents = fs::read_to_string(config_file)
        .map_err(|e| {
            SleepError::ConfigurationError(format!("{}: {}", config_file.display(), e))
        })
        .context("Reading config file")?;
    toml::from_str(&contents)
        .map_err(|e| {
            SleepError::ConfigurationError(format!("{}: {}", config_file.display(), e))
        })
        .context("Parsing config file")
}

/// Read and build the sleep policy from `config_file` and its drop-ins. A
/// missing main file leaves the built-in defaults in place.
pub fn load(config_file: &Path) -> Result<SleepConfig> {
    let mut config = if config_file.exists() {
        debug!("Reading main config file {}", config_file.display());
        read_config(config_file)?
    } else {
        debug!(
            "{} does not exist, using default sleep policy",
            config_file.display()
        );
        RawConfig::default()
    };

    for drop_in in find_drop_in_files(&drop_in_dir(config_file)) {
        debug!("Reading supplemental config: {}", drop_in.display());
        config.merge(read_config(&drop_in)?);
    }

    let config = config.resolve();
    config.validate()?;
    Ok(config)
}
