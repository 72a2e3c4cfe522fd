// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Run the executables in the system-sleep directories around a transition.
//!
//! Hooks are collected from every configured directory. A name found in an
//! earlier directory hides the same name in later ones, and a symlink to
//! /dev/null hides it without running anything. All hooks run at once; any
//! still running when the timeout passes are killed.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;

use crate::sleeputil::SleepVerb;

/// When a hook runs relative to the transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

/// Runs hooks around a transition. Hook failures are never reported back.
pub trait HookRunner {
    fn run(&self, phase: HookPhase, verb: SleepVerb);
}

/// The outcome of one batch of hooks, by hook name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
}

pub struct DirectoryHookRunner {
    dirs: Vec<PathBuf>,
    timeout: Duration,
}

fn is_masked(path: &Path) -> bool {
    matches!(fs::read_link(path), Ok(target) if target == Path::new("/dev/null"))
}

fn is_executable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => format!("{}", status),
    }
}

impl DirectoryHookRunner {
    pub fn new(dirs: Vec<PathBuf>, timeout: Duration) -> Self {
        DirectoryHookRunner { dirs, timeout }
    }

    /// List the hooks that would run, sorted by name.
    pub fn hooks(&self) -> Vec<PathBuf> {
        let mut found: BTreeMap<OsString, Option<PathBuf>> = BTreeMap::new();
        for dir in &self.dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to read hook directory {}: {}", dir.display(), e);
                    }
                    continue;
                }
            };

            for entry in entries.filter_map(|entry| entry.ok()) {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') || found.contains_key(&name) {
                    continue;
                }

                let path = entry.path();
                if is_masked(&path) {
                    debug!("Hook {} is masked", path.display());
                    found.insert(name, None);
                } else if is_executable_file(&path) {
                    found.insert(name, Some(path));
                } else {
                    debug!("Skipping non-executable {}", path.display());
                    found.insert(name, None);
                }
            }
        }

        found.into_values().flatten().collect()
    }

    /// Run every hook with `args` and wait for them, up to the timeout.
    /// Hooks still running at the deadline are killed and left behind.
    pub fn execute(&self, args: &[&str]) -> HookReport {
        let mut report = HookReport::default();
        let hooks = self.hooks();
        if hooks.is_empty() {
            return report;
        }

        let deadline = Instant::now() + self.timeout;
        let (sender, receiver) = unbounded();
        let mut pending: HashMap<u32, RunningHook> = HashMap::new();
        for hook in hooks {
            let name = hook.display().to_string();
            let child = match Command::new(&hook)
                .args(args)
                .stdin(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    warn!("Failed to start {}: {}", name, e);
                    report.failed.push(name);
                    continue;
                }
            };

            let pid = child.id();
            debug!("Started {} (pid {})", name, pid);
            let child = Arc::new(Mutex::new(child));
            let waited = child.clone();
            let sender = sender.clone();
            let waiter = thread::spawn(move || {
                wait_for_exit(pid);
                let status = match waited.lock() {
                    Ok(mut child) => child.wait(),
                    Err(_) => return,
                };
                let _ = sender.send((pid, status));
            });
            pending.insert(
                pid,
                RunningHook {
                    name,
                    child,
                    waiter,
                },
            );
        }
        drop(sender);

        while !pending.is_empty() {
            let (pid, status) = match receiver.recv_deadline(deadline) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            };

            let hook = match pending.remove(&pid) {
                Some(hook) => hook,
                None => continue,
            };
            if hook.waiter.join().is_err() {
                warn!("Waiter for {} panicked", hook.name);
            }
            match status {
                Ok(status) if status.success() => report.succeeded.push(hook.name),
                Ok(status) => {
                    warn!("{} failed with {}", hook.name, describe_status(&status));
                    report.failed.push(hook.name);
                }
                Err(e) => {
                    warn!("Failed to wait for {}: {}", hook.name, e);
                    report.failed.push(hook.name);
                }
            }
        }

        // A hook stuck in the kernel may not die right away. Its waiter
        // thread is detached rather than joined.
        for (_, hook) in pending {
            warn!("{} timed out, killing it", hook.name);
            match hook.child.lock() {
                // Does nothing if the waiter has reaped the hook since.
                Ok(mut child) => {
                    if let Err(e) = child.kill() {
                        debug!("Failed to kill {}: {}", hook.name, e);
                    }
                }
                Err(_) => warn!("Lost track of {}", hook.name),
            }
            report.timed_out.push(hook.name);
        }

        report.succeeded.sort();
        report.failed.sort();
        report.timed_out.sort();
        report
    }
}

/// A spawned hook. The waiter thread reaps the child through the shared
/// handle, so a kill through the same handle never hits a recycled pid.
struct RunningHook {
    name: String,
    child: Arc<Mutex<Child>>,
    waiter: JoinHandle<()>,
}

/// Block until the process exits, leaving it unreaped.
fn wait_for_exit(pid: u32) {
    let pid = Pid::from_raw(pid as i32);
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT;
    while let Err(Errno::EINTR) = waitid(Id::Pid(pid), flags) {}
}

impl HookRunner for DirectoryHookRunner {
    fn run(&self, phase: HookPhase, verb: SleepVerb) {
        let report = self.execute(&[phase.as_str(), verb.as_str()]);
        info!(
            "Ran {} {} hooks: {} succeeded, {} failed, {} timed out",
            phase.as_str(),
            verb,
            report.succeeded.len(),
            report.failed.len(),
            report.timed_out.len()
        );
    }
}
