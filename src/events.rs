// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Announce sleep transitions as tagged log records.

use log::{error, info};

use crate::sleeputil::SleepVerb;

/// Something worth announcing about a transition.
#[derive(Debug)]
pub enum SleepEvent<'a> {
    /// The power state is about to be written.
    Starting,
    /// The system went to sleep and came back.
    Resumed,
    /// The kernel refused every power state.
    Failed(&'a anyhow::Error),
}

pub trait EventSink {
    fn emit(&self, verb: SleepVerb, event: SleepEvent);
}

/// Sends events to the log with their SLEEP_START / SLEEP_STOP tags.
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, verb: SleepVerb, event: SleepEvent) {
        match event {
            SleepEvent::Starting => info!("SLEEP_START SLEEP={} Suspending system...", verb),
            SleepEvent::Resumed => info!("SLEEP_STOP SLEEP={} System resumed.", verb),
            SleepEvent::Failed(e) => error!(
                "SLEEP_STOP SLEEP={} Failed to suspend system. System resumed again: {:#}",
                verb, e
            ),
        }
    }
}
