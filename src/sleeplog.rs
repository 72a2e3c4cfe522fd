// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Route log records to the system log, and to stderr when asked.

use std::io::{self, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use syslog::{BasicLogger, Facility, Formatter3164};

/// Define the prefix to go on log messages.
const LOG_PREFIX: &str = "sleepman";

static STATE: OnceCell<Mutex<Sleeplog>> = OnceCell::new();

/// Initialize logging. Records go to syslog, and verbose mode also mirrors
/// them to stderr and enables debug records. Without a syslog to talk to,
/// everything goes to stderr.
pub fn init(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let syslogger = match create_syslogger() {
        Ok(syslogger) => syslogger,
        Err(e) => {
            stderrlog::new()
                .module(LOG_PREFIX)
                .verbosity(if verbose { 3 } else { 2 })
                .init()?;
            log::warn!("{}, logging to stderr", e);
            return Ok(());
        }
    };

    STATE
        .set(Mutex::new(Sleeplog {
            start: Instant::now(),
            pid: std::process::id(),
            syslogger,
            mirror_to_stderr: verbose,
        }))
        .map_err(|_| anyhow!("Logging is already initialized"))?;
    log::set_boxed_logger(Box::new(SleepLogger {})).map(|()| log::set_max_level(level))?;
    Ok(())
}

/// Define the instance that gets handed to the logging crate.
struct SleepLogger {}

impl Log for SleepLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let state = match STATE.get().map(|m| m.lock()) {
            Some(Ok(state)) => state,
            _ => return,
        };

        state.log_record(record)
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

struct Sleeplog {
    start: Instant,
    pid: u32,
    syslogger: BasicLogger,
    mirror_to_stderr: bool,
}

impl Sleeplog {
    fn log_record(&self, record: &Record) {
        if self.mirror_to_stderr {
            let line = record_to_rfc3164_line(record, self.pid, self.start.elapsed());
            let _ = io::stderr().write_all(&line);
        }

        self.syslogger.log(record)
    }
}

fn record_to_rfc3164_line(record: &Record, pid: u32, duration: Duration) -> Vec<u8> {
    let mut buf = Vec::new();
    let facprio = priority_from_level(record.level()) + (Facility::LOG_USER as usize);
    if let Some(file) = record.file() {
        let _ = writeln!(
            &mut buf,
            "<{}>{}: {}.{:03} {} [{}:{}] {}",
            facprio,
            LOG_PREFIX,
            duration.as_secs(),
            duration.subsec_millis(),
            pid,
            file,
            record.line().unwrap_or(0),
            record.args()
        );
    } else {
        let _ = writeln!(&mut buf, "<{}>{}: {}", facprio, LOG_PREFIX, record.args());
    }

    buf
}

fn priority_from_level(level: log::Level) -> usize {
    match level {
        log::Level::Error => 3,
        log::Level::Warn => 4,
        log::Level::Info => 6,
        log::Level::Debug | log::Level::Trace => 7,
    }
}

fn create_syslogger() -> Result<BasicLogger> {
    let formatter = Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: LOG_PREFIX.into(),
        pid: std::process::id(),
    };

    let logger =
        syslog::unix(formatter).map_err(|e| anyhow!("Could not connect to syslog: {}", e))?;
    Ok(BasicLogger::new(logger))
}
