// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Suspends the system, hibernates it, or both.

use std::path::PathBuf;

use getopts::{self, Options};
use log::error;
use sleepman::config::DEFAULT_CONFIG_PATH;
use sleepman::{self, SleepOptions, SleepVerb};

fn print_usage(message: &str, error: bool) {
    if error {
        eprintln!("{}", message)
    } else {
        println!("{}", message);
    }
}

fn app_usage(error: bool, options: &Options) {
    let brief = r#"Usage: sleepman [options] <command>
Suspend the system, hibernate the system, or both.

Commands:
    suspend -- Suspend the system.
    hibernate -- Hibernate the system.
    hybrid-sleep -- Both hibernate and suspend the system.
    suspend-then-hibernate -- Initially suspend, then hibernate the system
        after a fixed period of time.
"#;
    print_usage(&options.usage(brief), error);
}

fn sleepman_main() -> std::result::Result<(), ()> {
    let mut args = std::env::args();
    if args.next().is_none() {
        eprintln!("Expected executable name");
        return Err(());
    }

    let mut opts = Options::new();
    opts.optflag("h", "help", "Print this help text");
    opts.optflag("V", "version", "Print the version and exit");
    opts.optflag("v", "verbose", "Log debug messages, and mirror the log to stderr");
    opts.optopt(
        "c",
        "config",
        &format!("Read the sleep policy from this file (default {})", DEFAULT_CONFIG_PATH),
        "FILE",
    );
    let matches = match opts.parse(args) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to parse arguments: {}", e);
            app_usage(true, &opts);
            return Err(());
        }
    };

    if matches.opt_present("h") {
        app_usage(false, &opts);
        return Ok(());
    }

    if matches.opt_present("V") {
        println!("sleepman {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let verb = match matches.free.as_slice() {
        [verb] => match verb.parse::<SleepVerb>() {
            Ok(verb) => verb,
            Err(e) => {
                eprintln!("{}", e);
                return Err(());
            }
        },
        [] => {
            eprintln!("Expected a command");
            app_usage(true, &opts);
            return Err(());
        }
        _ => {
            eprintln!("Too many arguments");
            app_usage(true, &opts);
            return Err(());
        }
    };

    if let Err(e) = sleepman::sleeplog::init(matches.opt_present("v")) {
        eprintln!("failed to initialize logging: {}", e);
        return Err(());
    }

    let options = SleepOptions {
        verb,
        config_path: matches
            .opt_str("c")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };

    if let Err(e) = sleepman::sleep(options) {
        error!("Failed to {}: {:#}", verb, e);
        return Err(());
    }

    Ok(())
}

fn main() {
    std::process::exit(if sleepman_main().is_ok() { 0 } else { 1 });
}
