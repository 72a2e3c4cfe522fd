// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Carry out one trip into a sleep state and back.

use anyhow::{Context, Result};
use log::debug;

use crate::events::{EventSink, SleepEvent};
use crate::hooks::{HookPhase, HookRunner};
use crate::request::Transition;
use crate::sequencer;
use crate::sleeputil::SleepVerb;
use crate::sysfs::ControlSurface;

/// The kernel's power interface.
pub trait PowerInterface {
    type StateControl: ControlSurface;

    /// Open the power state control. Nothing has been changed if this fails.
    fn open_state_control(&mut self) -> Result<Self::StateControl>;
    /// Point the kernel at the hibernation image location.
    fn configure_hibernate_location(&mut self) -> Result<()>;
    /// Select the first hibernation disk mode the kernel accepts.
    fn write_mode(&mut self, modes: &[String]) -> Result<()>;
}

/// Performs a complete transition. Returns once the system is awake again.
pub trait Sleeper {
    fn sleep(&mut self, transition: &Transition) -> Result<()>;
}

pub struct SleepExecutor<P, H, E> {
    verb: SleepVerb,
    power: P,
    hooks: H,
    events: E,
}

impl<P, H, E> SleepExecutor<P, H, E>
where
    P: PowerInterface,
    H: HookRunner,
    E: EventSink,
{
    /// Create an executor. Hooks and events are labeled with `verb` no
    /// matter which transition is run.
    pub fn new(verb: SleepVerb, power: P, hooks: H, events: E) -> Self {
        SleepExecutor {
            verb,
            power,
            hooks,
            events,
        }
    }
}

impl<P, H, E> Sleeper for SleepExecutor<P, H, E>
where
    P: PowerInterface,
    H: HookRunner,
    E: EventSink,
{
    fn sleep(&mut self, transition: &Transition) -> Result<()> {
        // Open the state control first so that a failure here leaves
        // everything untouched.
        let mut state = self.power.open_state_control()?;

        if !transition.modes.is_empty() {
            self.power
                .configure_hibernate_location()
                .context("Failed to write hibernation disk offset")?;
            self.power
                .write_mode(&transition.modes)
                .context("Failed to write mode")?;
        }

        self.hooks.run(HookPhase::Pre, self.verb);
        self.events.emit(self.verb, SleepEvent::Starting);

        debug!("Writing power state, candidates {:?}", transition.states);
        let result = sequencer::write_state(&mut state, &transition.states);
        match &result {
            Ok(()) => self.events.emit(self.verb, SleepEvent::Resumed),
            Err(e) => self.events.emit(self.verb, SleepEvent::Failed(e)),
        }

        self.hooks.run(HookPhase::Post, self.verb);
        result
    }
}
