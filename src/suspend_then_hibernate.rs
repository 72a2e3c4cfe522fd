// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Suspend, and hibernate instead if the system is still asleep once the
//! hibernate delay has passed.

use std::os::fd::AsFd;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::executor::Sleeper;
use crate::request::Transition;
use crate::sleeputil::SleepError;

/// An armed timer.
pub trait WakeTimer {
    /// Check without blocking whether the timer has expired.
    fn has_fired(&self) -> Result<bool>;
}

/// Creates timers that fire, and wake the system, even while it is asleep.
pub trait WakeAlarm {
    type Timer: WakeTimer;

    fn arm(&self, delay: Duration) -> Result<Self::Timer>;
}

/// Wake alarms on the boot time clock, which keeps counting during suspend.
pub struct BoottimeAlarm;

pub struct BoottimeTimer {
    fd: TimerFd,
}

impl WakeAlarm for BoottimeAlarm {
    type Timer = BoottimeTimer;

    fn arm(&self, delay: Duration) -> Result<BoottimeTimer> {
        let fd = TimerFd::new(
            ClockId::CLOCK_BOOTTIME_ALARM,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(SleepError::TimerError)
        .context("Error creating timerfd")?;
        fd.set(
            Expiration::OneShot(TimeSpec::from_duration(delay)),
            TimerSetTimeFlags::empty(),
        )
        .map_err(SleepError::TimerError)
        .context("Error setting hibernate timer")?;

        debug!("Set timerfd wake alarm for {:?}", delay);
        Ok(BoottimeTimer { fd })
    }
}

impl WakeTimer for BoottimeTimer {
    fn has_fired(&self) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO)
            .map_err(SleepError::TimerError)
            .context("Error polling timerfd")?;
        Ok(fds[0]
            .revents()
            .map_or(false, |revents| revents.contains(PollFlags::POLLIN)))
    }
}

/// How a suspend-then-hibernate run ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum S2hOutcome {
    /// Something other than the timer woke the system.
    WokeEarly,
    /// The system hibernated and has resumed.
    Hibernated,
    /// Hibernation failed and the system suspended again instead.
    SuspendedAgain,
}

enum S2hState<T> {
    Idle,
    TimerArmed(T),
    Suspended(T),
    WokeEarly,
    WokeForHibernate,
    HibernateAttempted(Result<()>),
    FallbackSuspend(anyhow::Error),
    Done(S2hOutcome),
    Failed(anyhow::Error),
}

/// Run a suspend-then-hibernate cycle.
pub fn suspend_then_hibernate<S, A>(
    sleeper: &mut S,
    alarm: &A,
    delay: Duration,
    suspend: &Transition,
    hibernate: &Transition,
) -> Result<S2hOutcome>
where
    S: Sleeper + ?Sized,
    A: WakeAlarm + ?Sized,
{
    let mut state = S2hState::Idle;
    loop {
        state = match state {
            S2hState::Idle => match alarm.arm(delay) {
                Ok(timer) => S2hState::TimerArmed(timer),
                Err(e) => S2hState::Failed(e),
            },
            S2hState::TimerArmed(timer) => match sleeper.sleep(suspend) {
                Ok(()) => S2hState::Suspended(timer),
                Err(e) => S2hState::Failed(e),
            },
            S2hState::Suspended(timer) => {
                let fired = timer.has_fired();
                drop(timer);
                match fired {
                    Ok(false) => S2hState::WokeEarly,
                    Ok(true) => S2hState::WokeForHibernate,
                    Err(e) => S2hState::Failed(e),
                }
            }
            S2hState::WokeEarly => {
                debug!("Woke up before the hibernate alarm, done");
                S2hState::Done(S2hOutcome::WokeEarly)
            }
            S2hState::WokeForHibernate => {
                info!("Attempting to hibernate after waking from {:?} timer", delay);
                S2hState::HibernateAttempted(sleeper.sleep(hibernate))
            }
            S2hState::HibernateAttempted(Ok(())) => S2hState::Done(S2hOutcome::Hibernated),
            S2hState::HibernateAttempted(Err(e)) => {
                warn!("Couldn't hibernate, will try to suspend again: {:#}", e);
                S2hState::FallbackSuspend(e)
            }
            S2hState::FallbackSuspend(hibernate_err) => match sleeper.sleep(suspend) {
                Ok(()) => {
                    warn!("Hibernation was skipped, suspended again instead");
                    S2hState::Done(S2hOutcome::SuspendedAgain)
                }
                Err(e) => {
                    debug!("Hibernation had failed with: {:#}", hibernate_err);
                    S2hState::Failed(e.context(SleepError::TransitionFailed()))
                }
            },
            S2hState::Done(outcome) => return Ok(outcome),
            S2hState::Failed(e) => return Err(e),
        }
    }
}
