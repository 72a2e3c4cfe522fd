// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Listing for sleep library components.

pub mod config;
pub mod hooks;
pub mod sleeplog;

mod events;
mod executor;
mod fiemap;
mod location;
mod request;
mod sequencer;
mod sleeputil;
mod suspend_then_hibernate;
mod swap;
mod sysfs;

pub use sleeputil::{SleepError, SleepOptions, SleepVerb};

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};

use events::LogEventSink;
use executor::{SleepExecutor, Sleeper};
use hooks::DirectoryHookRunner;
use request::{SleepPlan, SleepRequest};
use suspend_then_hibernate::{suspend_then_hibernate, BoottimeAlarm};
use sysfs::SysPower;

/// Put the system to sleep as requested. This returns once the system has
/// woken up again, or when it could not be put to sleep.
pub fn sleep(options: SleepOptions) -> Result<()> {
    let config = config::load(&options.config_path).context("Failed to load sleep config")?;
    let cmdline = sleeputil::read_kernel_cmdline(Path::new("/"));
    let request = SleepRequest::new(options.verb, &config, &cmdline)?;
    debug!("Sleep request: {:?}", request);

    let power = SysPower::new(request.resume_offset.clone());
    let hooks = DirectoryHookRunner::new(config.hook_dirs.clone(), config.hook_timeout);
    let mut executor = SleepExecutor::new(request.verb, power, hooks, LogEventSink);

    match &request.plan {
        SleepPlan::Immediate(transition) => executor.sleep(transition),
        SleepPlan::Delayed {
            delay,
            suspend,
            hibernate,
        } => {
            let outcome =
                suspend_then_hibernate(&mut executor, &BoottimeAlarm, *delay, suspend, hibernate)?;
            info!("{} finished: {:?}", request.verb, outcome);
            Ok(())
        }
    }
}
