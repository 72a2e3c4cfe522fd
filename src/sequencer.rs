// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Offer an ordered list of tokens to a control until one is accepted.

use anyhow::Result;
use log::debug;

use crate::sleeputil::SleepError;
use crate::sysfs::ControlSurface;

/// Try each token in order and stop at the first one the control accepts.
/// If all are rejected, the error from the last attempt is returned. A control
/// that can no longer be opened ends the attempts right away.
fn write_first_accepted<S: ControlSurface + ?Sized>(
    control: &mut S,
    what: &str,
    tokens: &[String],
) -> Result<()> {
    let mut last_err = None;
    for token in tokens {
        match control.write_token(token) {
            Ok(()) => {
                debug!("Using '{}' for {}", token, what);
                return Ok(());
            }
            Err(e) => {
                debug!("Failed to write '{}' to {}: {:#}", token, what, e);
                let fatal = matches!(
                    e.downcast_ref::<SleepError>(),
                    Some(SleepError::CannotOpenControl(_, _))
                );
                if fatal {
                    return Err(e);
                }
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Select a hibernation disk mode.
pub fn write_mode<S: ControlSurface + ?Sized>(control: &mut S, modes: &[String]) -> Result<()> {
    write_first_accepted(control, "disk mode", modes)
}

/// Enter a power state. On success this returns once the system has woken.
pub fn write_state<S: ControlSurface + ?Sized>(control: &mut S, states: &[String]) -> Result<()> {
    write_first_accepted(control, "power state", states)
}
