// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Build the immutable description of one sleep invocation.

use std::time::Duration;

use anyhow::Result;

use crate::config::SleepConfig;
use crate::sleeputil::{parse_resume_offset, SleepError, SleepVerb};

/// The disk modes and power states to try for one trip through the kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    pub modes: Vec<String>,
    pub states: Vec<String>,
}

impl Transition {
    fn new(modes: &[String], states: &[String]) -> Self {
        Transition {
            modes: modes.to_vec(),
            states: states.to_vec(),
        }
    }
}

/// What the invocation does once it starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SleepPlan {
    /// A single transition.
    Immediate(Transition),
    /// Suspend, then hibernate if still asleep after `delay`.
    Delayed {
        delay: Duration,
        suspend: Transition,
        hibernate: Transition,
    },
}

/// The resolved request for one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SleepRequest {
    pub verb: SleepVerb,
    pub plan: SleepPlan,
    /// Explicit resume offset from the kernel command line.
    pub resume_offset: Option<String>,
}

fn checked_transition(verb: SleepVerb, modes: &[String], states: &[String]) -> Result<Transition> {
    if states.is_empty() {
        return Err(SleepError::ConfigurationError(format!(
            "No power states configured for {}",
            verb
        ))
        .into());
    }

    Ok(Transition::new(modes, states))
}

impl SleepRequest {
    /// Resolve `verb` against the sleep policy and the kernel command line.
    pub fn new(verb: SleepVerb, config: &SleepConfig, kernel_cmdline: &str) -> Result<Self> {
        let (allowed, modes, states) = config.sleep_settings(verb);
        if !allowed {
            return Err(SleepError::VerbDisabled(verb).into());
        }

        let plan = match verb {
            SleepVerb::SuspendThenHibernate => {
                let (_, hibernate_modes, hibernate_states) =
                    config.sleep_settings(SleepVerb::Hibernate);
                SleepPlan::Delayed {
                    delay: config.hibernate_delay,
                    suspend: checked_transition(SleepVerb::Suspend, modes, states)?,
                    hibernate: checked_transition(
                        SleepVerb::Hibernate,
                        hibernate_modes,
                        hibernate_states,
                    )?,
                }
            }
            _ => SleepPlan::Immediate(checked_transition(verb, modes, states)?),
        };

        Ok(SleepRequest {
            verb,
            plan,
            resume_offset: parse_resume_offset(kernel_cmdline),
        })
    }
}
